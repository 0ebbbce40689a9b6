// src/core/alerts.rs

//! Operator-facing notifications: Slack messages through the pub/sub proxy
//! and Grafana dashboard annotations.

use crate::core::client::KeyValueStore;
use chrono::Local;
use serde_json::json;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

/// The channel watched by the Slack bridge process.
pub const SLACK_PROXY_CHANNEL: &str = "slack-messages";

/// Name under which this process signs its alerts.
const SOURCE_NAME: &str = "coordinator";

#[derive(Clone)]
pub struct Alerts {
    store: Arc<dyn KeyValueStore>,
    slack_channel: String,
    http: reqwest::Client,
    grafana_url: String,
    grafana_token: Option<String>,
}

impl Alerts {
    pub fn new(store: Arc<dyn KeyValueStore>, slack_channel: &str, grafana_url: &str) -> Self {
        let grafana_token = env::var("GRAFANA_AUTH").ok();
        if grafana_token.is_none() {
            warn!("Grafana token not set.");
        }
        Self {
            store,
            slack_channel: slack_channel.to_string(),
            http: reqwest::Client::new(),
            grafana_url: grafana_url.to_string(),
            grafana_token,
        }
    }

    /// Publishes a message to the alerts Slack channel via the proxy.
    /// Message format: `<Slack channel>:[<timestamp>] <source>: <text>`.
    pub async fn alert(&self, message: &str) {
        info!("{message}");
        let alert_msg = format!(
            "{}:[{}] {}: {}",
            self.slack_channel,
            timestring(),
            SOURCE_NAME,
            message
        );
        if let Err(e) = self.store.publish(SLACK_PROXY_CHANNEL, &alert_msg).await {
            warn!("Could not publish alert to Slack proxy: {e}");
        }
    }

    /// Creates a Grafana annotation. A missing token disables annotations;
    /// failures are logged and never interfere with state transitions.
    pub async fn annotate(&self, tag: &str, text: &str) {
        let Some(token) = &self.grafana_token else {
            return;
        };
        let annotation = json!({
            "time": chrono::Utc::now().timestamp_millis(),
            "isRegion": false,
            "tags": [tag],
            "text": text,
        });
        let result = self
            .http
            .post(&self.grafana_url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&annotation)
            .send()
            .await;
        match result {
            Ok(response) => info!("Annotating Grafana, response: {}", response.status()),
            Err(e) => warn!("Could not annotate Grafana: {e}"),
        }
    }
}

/// A standard format to report the current time in.
pub fn timestring() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string()
}
