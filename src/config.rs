// src/config.rs

//! Manages coordinator configuration: loading, validation and defaults.

use crate::core::CoordinatorError;
use crate::core::instance::Instance;
use anyhow::{Context as _, Result, anyhow};
use config::FileFormat;
use serde::{Deserialize, Serialize};

/// A raw representation of the YAML config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_redis_host")]
    redis_host: String,
    #[serde(default = "default_redis_port")]
    redis_port: u16,
    /// Channels carrying telescope-state events, recording timeouts and
    /// analyzer results.
    #[serde(default = "default_channels")]
    channels: Vec<String>,
    /// Every DAQ instance the coordinator may allocate, as `host/index`.
    hashpipe_instances: Vec<String>,
    /// Subarrays this coordinator instance manages.
    arrays: Vec<String>,
    #[serde(default = "default_streams_per_instance")]
    streams_per_instance: usize,
    #[serde(default = "default_gateway_domain")]
    gateway_domain: String,
    #[serde(default = "default_telescope_name")]
    telescope_name: String,
    #[serde(default = "default_primary_proposal_id")]
    primary_proposal_id: String,
    #[serde(default = "default_slack_channel")]
    slack_channel: String,
    #[serde(default = "default_grafana_url")]
    grafana_url: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_channels() -> Vec<String> {
    vec![
        "sensor_alerts".to_string(),
        "rec_result".to_string(),
        "proc_result".to_string(),
    ]
}
fn default_streams_per_instance() -> usize {
    4
}
fn default_gateway_domain() -> String {
    "bluse".to_string()
}
fn default_telescope_name() -> String {
    "MeerKAT".to_string()
}
fn default_primary_proposal_id() -> String {
    "EXT-20220504-DM-01".to_string()
}
fn default_slack_channel() -> String {
    "meerkat-obs-log".to_string()
}
fn default_grafana_url() -> String {
    "http://blh0:3000/api/annotations".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The validated coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub channels: Vec<String>,
    pub hashpipe_instances: Vec<String>,
    pub arrays: Vec<String>,
    pub streams_per_instance: usize,
    pub gateway_domain: String,
    pub telescope_name: String,
    pub primary_proposal_id: String,
    pub slack_channel: String,
    pub grafana_url: String,
    pub log_level: String,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::File::new(path, FileFormat::Yaml))
            .build()
            .with_context(|| format!("Failed to read config file at '{path}'"))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse YAML from '{path}'"))?;

        let cfg = Config {
            redis_host: raw.redis_host,
            redis_port: raw.redis_port,
            channels: raw.channels,
            hashpipe_instances: raw.hashpipe_instances,
            arrays: raw.arrays,
            streams_per_instance: raw.streams_per_instance,
            gateway_domain: raw.gateway_domain,
            telescope_name: raw.telescope_name,
            primary_proposal_id: raw.primary_proposal_id,
            slack_channel: raw.slack_channel,
            grafana_url: raw.grafana_url,
            log_level: raw.log_level,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.redis_port == 0 {
            return Err(anyhow!("redis_port cannot be 0"));
        }
        if self.redis_host.trim().is_empty() {
            return Err(anyhow!("redis_host cannot be empty"));
        }
        if self.hashpipe_instances.is_empty() {
            return Err(anyhow!("hashpipe_instances cannot be empty"));
        }
        if self.arrays.is_empty() {
            return Err(anyhow!("arrays cannot be empty"));
        }
        if self.channels.is_empty() {
            return Err(anyhow!("channels cannot be empty"));
        }
        if self.streams_per_instance == 0 {
            return Err(anyhow!("streams_per_instance cannot be 0"));
        }
        for name in &self.hashpipe_instances {
            name.parse::<Instance>()
                .map_err(|e: CoordinatorError| anyhow!(e))?;
        }
        Ok(())
    }

    /// The store endpoint as `host:port`.
    pub fn redis_addr(&self) -> String {
        format!("{}:{}", self.redis_host, self.redis_port)
    }

    /// The configured DAQ instances as typed identities.
    pub fn instances(&self) -> Vec<Instance> {
        self.hashpipe_instances
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            channels: default_channels(),
            hashpipe_instances: Vec::new(),
            arrays: Vec::new(),
            streams_per_instance: default_streams_per_instance(),
            gateway_domain: default_gateway_domain(),
            telescope_name: default_telescope_name(),
            primary_proposal_id: default_primary_proposal_id(),
            slack_channel: default_slack_channel(),
            grafana_url: default_grafana_url(),
            log_level: default_log_level(),
        }
    }
}
