// src/core/status.rs

//! Operator status inspection: a point-in-time summary of DAQ health,
//! multicast subscriptions and recording activity, assembled from the
//! per-instance status hashes.

use crate::core::CoordinatorError;
use crate::core::client::KeyValueStore;
use crate::core::gateway::Gateway;
use crate::core::instance::Instance;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use tracing::warn;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// A DAQPULSE older than this marks the pipeline as broken.
const MAX_PULSE_AGE_SECONDS: i64 = 60;

/// One instance's interpreted status buffer.
#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    pub netstat: Option<String>,
    pub daqstate: Option<String>,
    pub destip: Option<String>,
    pub pktidx: Option<i64>,
    pub pktstart: Option<i64>,
    pub pktstop: Option<i64>,
    pub pulse_age_seconds: Option<i64>,
}

impl InstanceStatus {
    fn from_hash(hash: &HashMap<String, String>) -> Self {
        Self {
            netstat: hash.get("NETSTAT").cloned(),
            daqstate: hash.get("DAQSTATE").cloned(),
            destip: hash.get("DESTIP").cloned(),
            pktidx: hash.get("PKTIDX").and_then(|v| v.trim().parse().ok()),
            pktstart: hash.get("PKTSTART").and_then(|v| v.trim().parse().ok()),
            pktstop: hash.get("PKTSTOP").and_then(|v| v.trim().parse().ok()),
            pulse_age_seconds: hash.get("DAQPULSE").and_then(|v| pulse_age(v)),
        }
    }

    /// Whether the DAQ heartbeat has gone stale.
    pub fn is_broken(&self) -> bool {
        match self.pulse_age_seconds {
            Some(age) => age.abs() > MAX_PULSE_AGE_SECONDS,
            None => false,
        }
    }

    /// Whether the instance is joined to a multicast group.
    pub fn is_subscribed(&self) -> bool {
        self.destip
            .as_deref()
            .is_some_and(|ip| !ip.is_empty() && ip != "0.0.0.0")
    }

    /// Whether the instance is currently capturing: armed with a PKTSTART
    /// and not yet past its PKTSTOP.
    pub fn is_recording(&self) -> bool {
        match (self.pktidx, self.pktstart, self.pktstop) {
            (Some(idx), Some(start), Some(stop)) => start > 0 && idx < stop,
            // A partially written buffer is a race; treat it as in use.
            (_, Some(start), _) => start > 0,
            _ => false,
        }
    }
}

/// The age in seconds of a DAQPULSE value, which arrives in C locale
/// datetime form, e.g. `Mon Jan  2 15:04:05 2006`.
fn pulse_age(pulse: &str) -> Option<i64> {
    let parsed = NaiveDateTime::parse_from_str(pulse.trim(), "%a %b %e %H:%M:%S %Y").ok()?;
    let now = chrono::Local::now().naive_local();
    Some((now - parsed).num_seconds())
}

/// A point-in-time summary over a set of instances.
#[derive(Debug, Default)]
pub struct FleetStatus {
    pub broken: Vec<Instance>,
    pub subscribed: Vec<Instance>,
    pub recording: Vec<Instance>,
    pub idle: Vec<Instance>,
}

/// Reads and interprets every instance's status hash.
pub async fn fleet_status(
    store: &dyn KeyValueStore,
    gateway: &Gateway,
    instances: &[Instance],
) -> Result<FleetStatus> {
    let mut status = FleetStatus::default();
    for instance in instances {
        let hash = store.hgetall(&gateway.status_key(instance)).await?;
        if hash.is_empty() {
            warn!("No status buffer for {instance}");
            status.broken.push(instance.clone());
            continue;
        }
        let parsed = InstanceStatus::from_hash(&hash);
        if parsed.is_broken() {
            status.broken.push(instance.clone());
        }
        if parsed.is_recording() {
            status.recording.push(instance.clone());
        } else if parsed.is_subscribed() {
            status.subscribed.push(instance.clone());
        } else {
            status.idle.push(instance.clone());
        }
    }
    Ok(status)
}

impl FleetStatus {
    /// Renders the summary for the operator console.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.broken.is_empty() {
            out.push_str(&format!(
                "{} daqs look broken: {}\n",
                self.broken.len(),
                names(&self.broken)
            ));
        }
        out.push_str(&format!(
            "{} instances are subscribed to F-engine multicast: {}\n",
            self.subscribed.len() + self.recording.len(),
            names(
                &self
                    .subscribed
                    .iter()
                    .chain(&self.recording)
                    .cloned()
                    .collect::<Vec<_>>()
            )
        ));
        if self.recording.is_empty() {
            out.push_str("no instances are currently recording\n");
        } else {
            out.push_str(&format!(
                "{} instances are currently recording: {}\n",
                self.recording.len(),
                names(&self.recording)
            ));
        }
        if !self.idle.is_empty() {
            out.push_str(&format!(
                "{} instances are idle: {}\n",
                self.idle.len(),
                names(&self.idle)
            ));
        }
        out
    }
}

fn names(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
