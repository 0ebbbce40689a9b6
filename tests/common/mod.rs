// tests/common/mod.rs

//! Shared test doubles and fixtures: an in-memory `KeyValueStore`, a
//! recording `ProcessControl`, and sensor seeding for a plausible subarray.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use bluse_coordinator::config::Config;
use bluse_coordinator::core::CoordinatorError;
use bluse_coordinator::core::analyzer::{ControlCommand, ProcessControl};
use bluse_coordinator::core::client::KeyValueStore;
use bluse_coordinator::core::context::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Subarray used throughout the scenario tests.
pub const ARRAY: &str = "array_1";

/// The four instances of the cold-start scenario.
pub const INSTANCES: [&str; 4] = ["blpn0/0", "blpn0/1", "blpn1/0", "blpn1/1"];

/// An in-memory stand-in for the shared store. Publishes are recorded, and
/// the listener count returned by `publish` is configurable so gateway
/// under-delivery paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    strings: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    raw_hashes: Mutex<HashMap<String, Vec<(String, Bytes)>>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
    zsets: Mutex<HashMap<String, Vec<(f64, String)>>>,
    published: Mutex<Vec<(String, String)>>,
    listeners: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        store.listeners.store(16, Ordering::Relaxed);
        Arc::new(store)
    }

    /// Sets the listener count reported for every publish.
    pub fn set_listeners(&self, n: usize) {
        self.listeners.store(n, Ordering::Relaxed);
    }

    /// Every `(channel, message)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Messages published on one channel, in order.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Whether any published message on any channel contains `needle`.
    pub fn published_containing(&self, needle: &str) -> bool {
        self.published.lock().iter().any(|(_, m)| m.contains(needle))
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    pub fn seed(&self, key: &str, value: &str) {
        self.strings.lock().insert(key.to_string(), value.to_string());
    }

    pub fn seed_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let mut hashes = self.hashes.lock();
        let entry = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.to_string());
        }
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn zset(&self, key: &str) -> Vec<(f64, String)> {
        self.zsets.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn raw_hash(&self, key: &str) -> Vec<(String, Bytes)> {
        self.raw_hashes.lock().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.strings.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut n = 0;
        if self.strings.lock().remove(key).is_some() {
            n += 1;
        }
        if self.hashes.lock().remove(key).is_some() {
            n += 1;
        }
        if self.lists.lock().remove(key).is_some() {
            n += 1;
        }
        Ok(n)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_bytes(&self, key: &str, fields: &[(String, Bytes)]) -> Result<()> {
        self.raw_hashes
            .lock()
            .insert(key.to_string(), fields.to_vec());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(self.lists.lock().get(key).map(|l| l.len()).unwrap_or(0) as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let lists = self.lists.lock();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=(stop as usize).min(list.len() - 1)].to_vec())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.zsets
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((score, member.to_string()));
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.published
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(self.listeners.load(Ordering::Relaxed))
    }
}

/// Records every control command issued; always acknowledges.
#[derive(Default)]
pub struct RecordingControl {
    pub commands: Mutex<Vec<(String, String, ControlCommand)>>,
}

impl RecordingControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<(String, String, ControlCommand)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn control(&self, host: &str, process: &str, command: ControlCommand) -> bool {
        self.commands
            .lock()
            .push((host.to_string(), process.to_string(), command));
        true
    }
}

/// A config covering the standard cold-start scenario: four instances, one
/// subarray, four streams per instance.
pub fn test_config() -> Config {
    Config {
        hashpipe_instances: INSTANCES.iter().map(|s| s.to_string()).collect(),
        arrays: vec![ARRAY.to_string()],
        ..Config::default()
    }
}

/// Builds a context over the given doubles.
pub fn test_context(
    store: Arc<MemoryStore>,
    control: Arc<RecordingControl>,
    config: Config,
) -> Arc<Context> {
    Context::new(store, Arc::new(config), control)
}

/// Seeds every sensor key the subscribe sequence reads: a 16-stream subarray
/// on MeerKAT L-band numbers.
pub async fn seed_subarray_sensors(store: &MemoryStore) {
    store.seed(&format!("{ARRAY}:cbf_name"), "cbf_1");
    store.seed(&format!("{ARRAY}:cbf_prefix"), "wide");
    store.seed(&format!("{ARRAY}:n_channels"), "4096");
    store.seed(
        &format!("{ARRAY}:streams"),
        "{'cbf.antenna_channelised_voltage': {'wide.antenna-channelised-voltage': 'spead://239.9.0.64+15:7148'}}",
    );
    store.seed(&format!("{ARRAY}:cbf_1_wide_adc_sample_rate"), "1712000000");
    store.seed(
        &format!("{ARRAY}:cbf_1_wide_antenna_channelised_voltage_n_chans_per_substream"),
        "16",
    );
    store.seed(
        &format!("{ARRAY}:cbf_1_wide_antenna_channelised_voltage_spectra_per_heap"),
        "256",
    );
    store.seed(
        &format!("{ARRAY}:cbf_1_wide_antenna_channelised_voltage_n_samples_between_spectra"),
        "8192",
    );
    store.seed(
        &format!("{ARRAY}:subarray_1_streams_wide_antenna_channelised_voltage_centre_frequency"),
        "1284000000",
    );
    store.seed(&format!("{ARRAY}:cbf_1_wide_bandwidth"), "856000000");
    store.seed(&format!("{ARRAY}:subarray_1_band"), "l");
    store.seed(&format!("{ARRAY}:sched_observation_schedule_1"), "20230107-0012,rest");
    let antennas: Vec<String> = (0..16).map(|i| format!("m{i:03}")).collect();
    store
        .rpush(&format!("{ARRAY}:antennas"), &antennas)
        .await
        .unwrap();
    // Seed sync such that a PKTIDX around 100000 maps close to wall time.
    // One packet index spans HCLOCKS/(2e6*FENCHAN*|CHAN_BW|) seconds.
    let hclocks = 8192.0 * 256.0;
    let fenchan = 4096.0;
    let chan_bw = 1712e6 / 2.0 / 4096.0 / 1e6; // MHz
    let per_idx = hclocks / (2e6 * fenchan * chan_bw);
    let synctime = (chrono::Utc::now().timestamp() as f64 - 100_000.0 * per_idx) as i64;
    store.seed(&format!("{ARRAY}:cbf_1_wide_sync_time"), &synctime.to_string());
}

/// Seeds the target sensors and per-instance status buffers a record entry
/// needs. `pktidx` applies to every instance.
pub fn seed_recording_sensors(store: &MemoryStore, pktidx: i64) {
    let now = chrono::Utc::now().timestamp() as f64;
    store.seed(
        &format!("{ARRAY}:target"),
        "'J0918-1205 | Hyd A | Hydra A, radec, 9:18:05.28, -12:05:48.9'",
    );
    store.seed(&format!("{ARRAY}:last-target"), &now.to_string());
    store.seed(&format!("{ARRAY}:last-track-end"), &now.to_string());
    for instance in INSTANCES {
        store.seed_hash(
            &format!("bluse://{instance}/status"),
            &[
                ("NETSTAT", "receiving"),
                ("PKTIDX", &pktidx.to_string()),
                ("DATADIR", "/buf0/previous"),
            ],
        );
    }
}
