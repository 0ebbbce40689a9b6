// src/core/client/mod.rs

//! The typed key/value + pub/sub client facade over the shared store.
//!
//! `KeyValueStore` is the narrow surface the rest of the coordinator talks
//! to; `RedisClient` implements it over a RESP2 connection, and `Subscriber`
//! holds a dedicated connection for the inbound event channels.

use crate::core::CoordinatorError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

pub mod protocol;

pub use protocol::{RespCodec, RespFrame};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Typed read/write/publish access to the shared key/value store. All methods
/// operate on UTF-8 values except `hset_bytes`, which stores raw payloads
/// (calibration solutions).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<u64>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_bytes(&self, key: &str, fields: &[(String, Bytes)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn llen(&self, key: &str) -> Result<u64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()>;
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// Publishes a message and returns the number of listeners that received
    /// it. The gateway retry logic depends on this count.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;
}

/// A single multiplexed connection to the store, re-established on failure.
/// One request is in flight at a time; the coordinator's command rate is low
/// enough that this is never a bottleneck.
#[derive(Debug)]
pub struct RedisClient {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    codec: RespCodec,
    buf: BytesMut,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                CoordinatorError::Internal(format!("timed out connecting to {addr}"))
            })??;
        Ok(Self {
            stream,
            codec: RespCodec,
            buf: BytesMut::with_capacity(4096),
        })
    }

    async fn request(&mut self, frame: RespFrame) -> Result<RespFrame> {
        let mut write_buf = BytesMut::new();
        self.codec.encode(frame, &mut write_buf)?;
        self.stream.write_all(&write_buf).await?;
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<RespFrame> {
        loop {
            if let Some(reply) = self.codec.decode(&mut self.buf)? {
                return Ok(reply);
            }
            let read_fut = self.stream.read_buf(&mut self.buf);
            match tokio::time::timeout(READ_TIMEOUT, read_fut).await {
                Ok(Ok(0)) => {
                    return Err(CoordinatorError::Internal(
                        "connection closed by peer".to_string(),
                    ));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(CoordinatorError::Internal(
                        "read timeout while waiting for reply".to_string(),
                    ));
                }
            }
        }
    }
}

impl RedisClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Connects eagerly so configuration errors surface at startup.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let client = Self::new(addr);
        let mut guard = client.conn.lock().await;
        *guard = Some(Connection::open(&client.addr).await?);
        drop(guard);
        Ok(client)
    }

    /// Sends one command, reconnecting once if the cached connection has gone
    /// stale since the last request.
    async fn request(&self, parts: Vec<Bytes>) -> Result<RespFrame> {
        let frame = RespFrame::command(parts);
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Connection::open(&self.addr).await?);
        }
        let conn = guard.as_mut().expect("connection present");
        match conn.request(frame.clone()).await {
            Ok(reply) => Self::check_error(reply),
            Err(e) => {
                debug!("Reconnecting to {} after request failure: {e}", self.addr);
                *guard = Some(Connection::open(&self.addr).await?);
                let conn = guard.as_mut().expect("connection present");
                Self::check_error(conn.request(frame).await?)
            }
        }
    }

    fn check_error(reply: RespFrame) -> Result<RespFrame> {
        match reply {
            RespFrame::Error(e) => Err(CoordinatorError::UnexpectedReply(e)),
            other => Ok(other),
        }
    }

    fn expect_integer(reply: RespFrame) -> Result<i64> {
        match reply {
            RespFrame::Integer(i) => Ok(i),
            other => Err(CoordinatorError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    fn expect_array(reply: RespFrame) -> Result<Vec<RespFrame>> {
        match reply {
            RespFrame::Array(items) => Ok(items),
            RespFrame::NullArray => Ok(Vec::new()),
            other => Err(CoordinatorError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.request(Self::args(&["GET", key])).await? {
            RespFrame::Null => Ok(None),
            other => Ok(other.into_string()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.request(Self::args(&["SET", key, value])).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let n = Self::expect_integer(self.request(Self::args(&["DEL", key])).await?)?;
        Ok(n as u64)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.request(Self::args(&["HSET", key, field, value]))
            .await?;
        Ok(())
    }

    async fn hset_bytes(&self, key: &str, fields: &[(String, Bytes)]) -> Result<()> {
        let mut parts: Vec<Bytes> = Self::args(&["HSET", key]);
        for (field, value) in fields {
            parts.push(Bytes::copy_from_slice(field.as_bytes()));
            parts.push(value.clone());
        }
        self.request(parts).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.request(Self::args(&["HGET", key, field])).await? {
            RespFrame::Null => Ok(None),
            other => Ok(other.into_string()),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let items = Self::expect_array(self.request(Self::args(&["HGETALL", key])).await?)?;
        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(field), Some(value)) = (field.into_string(), value.into_string()) {
                map.insert(field, value);
            }
        }
        Ok(map)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let n = Self::expect_integer(self.request(Self::args(&["LLEN", key])).await?)?;
        Ok(n as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let items = Self::expect_array(
            self.request(Self::args(&[
                "LRANGE",
                key,
                &start.to_string(),
                &stop.to_string(),
            ]))
            .await?,
        )?;
        Ok(items.into_iter().filter_map(|f| f.into_string()).collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.request(Self::args(&["LPUSH", key, value])).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut parts = Self::args(&["RPUSH", key]);
        parts.extend(values.iter().map(|v| Bytes::copy_from_slice(v.as_bytes())));
        self.request(parts).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.request(Self::args(&["ZADD", key, &score.to_string(), member]))
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let n =
            Self::expect_integer(self.request(Self::args(&["PUBLISH", channel, message])).await?)?;
        Ok(n.max(0) as usize)
    }
}

/// A dedicated subscription connection for the inbound event channels. Kept
/// separate from `RedisClient` because a subscribed RESP connection cannot
/// issue regular commands.
#[derive(Debug)]
pub struct Subscriber {
    conn: Connection,
}

impl Subscriber {
    pub async fn connect(addr: &str, channels: &[String]) -> Result<Self> {
        let mut conn = Connection::open(addr).await?;
        let mut parts: Vec<Bytes> = vec![Bytes::from_static(b"SUBSCRIBE")];
        parts.extend(
            channels
                .iter()
                .map(|c| Bytes::copy_from_slice(c.as_bytes())),
        );
        let mut write_buf = BytesMut::new();
        conn.codec.encode(RespFrame::command(parts), &mut write_buf)?;
        conn.stream.write_all(&write_buf).await?;
        // One confirmation frame arrives per channel.
        for _ in channels {
            conn.read_frame().await?;
        }
        Ok(Self { conn })
    }

    /// Waits for the next published message, returning `(channel, payload)`.
    /// Subscription housekeeping frames are skipped.
    pub async fn next_message(&mut self) -> Result<(String, String)> {
        loop {
            let frame = self.next_frame().await?;
            let RespFrame::Array(parts) = frame else {
                warn!("Ignoring non-array frame on subscription connection");
                continue;
            };
            if parts.len() == 3 {
                let kind = parts[0].clone().into_string().unwrap_or_default();
                if kind == "message" {
                    let channel = parts[1].clone().into_string().unwrap_or_default();
                    let payload = parts[2].clone().into_string().unwrap_or_default();
                    return Ok((channel, payload));
                }
            }
        }
    }

    /// Like `Connection::read_frame` but without the read timeout: the event
    /// stream is quiet for hours between observations.
    async fn next_frame(&mut self) -> Result<RespFrame> {
        loop {
            if let Some(reply) = self.conn.codec.decode(&mut self.conn.buf)? {
                return Ok(reply);
            }
            let n = self.conn.stream.read_buf(&mut self.conn.buf).await?;
            if n == 0 {
                return Err(CoordinatorError::Internal(
                    "subscription connection closed by peer".to_string(),
                ));
            }
        }
    }
}
