// src/core/analyzer.rs

//! Remote control of per-host worker processes (analyzers, DAQ pipelines and
//! gateways) through the process supervisor's control socket.

use crate::core::CoordinatorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Port of the process supervisor's control socket on every DAQ host.
const CONTROL_PORT: u16 = 5555;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands accepted by the host process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Restart,
}

impl ControlCommand {
    fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Start => "start",
            ControlCommand::Stop => "stop",
            ControlCommand::Restart => "restart",
        }
    }
}

#[derive(Serialize)]
struct ControlRequest<'a> {
    command: &'a str,
    properties: ControlProperties<'a>,
}

#[derive(Serialize)]
struct ControlProperties<'a> {
    name: &'a str,
    waiting: bool,
    #[serde(rename = "match")]
    match_mode: &'a str,
}

#[derive(Deserialize)]
struct ControlReply {
    status: String,
}

/// Issues a command to a named process on a host. Implemented over the
/// control socket in production and by a recording double in tests.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Returns true when the supervisor acknowledged the command.
    async fn control(&self, host: &str, process: &str, command: ControlCommand) -> bool;
}

/// Sends one JSON control message per command to `<host>:5555`, expecting a
/// `{"status": "ok"}` reply. The connection is opened and closed per command.
#[derive(Debug, Default)]
pub struct CircusClient;

impl CircusClient {
    async fn send(&self, host: &str, process: &str, command: ControlCommand) -> Result<()> {
        let addr = format!("{host}:{CONTROL_PORT}");
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| CoordinatorError::ControlError(format!("timed out connecting to {addr}")))?
            .map_err(|e| CoordinatorError::ControlError(format!("{addr}: {e}")))?;

        let request = ControlRequest {
            command: command.as_str(),
            properties: ControlProperties {
                name: process,
                waiting: false,
                match_mode: "simple",
            },
        };
        let payload = serde_json::to_vec(&request)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CoordinatorError::ControlError(format!("{addr}: {e}")))?;

        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];
        let reply: ControlReply = loop {
            let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    CoordinatorError::ControlError(format!("timed out reading reply from {addr}"))
                })?
                .map_err(|e| CoordinatorError::ControlError(format!("{addr}: {e}")))?;
            if n == 0 {
                return Err(CoordinatorError::ControlError(format!(
                    "{addr} closed the connection before replying"
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
            match serde_json::from_slice(&buf) {
                Ok(reply) => break reply,
                Err(e) if e.is_eof() => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if reply.status != "ok" {
            return Err(CoordinatorError::ControlError(format!(
                "{process} on {host}: status {}",
                reply.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessControl for CircusClient {
    async fn control(&self, host: &str, process: &str, command: ControlCommand) -> bool {
        match self.send(host, process, command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Control command failed: {e}");
                false
            }
        }
    }
}
