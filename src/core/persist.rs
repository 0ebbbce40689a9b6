// src/core/persist.rs

//! Durable persistence of the per-subarray state machines and the free pool,
//! so the coordinator can restart mid-observation.

use crate::core::CoordinatorError;
use crate::core::client::KeyValueStore;
use crate::core::instance::{Instance, InstanceSet};
use serde::{Deserialize, Serialize};
use tracing::info;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Key holding the globally available, unassigned instances.
const FREE_INSTANCES_KEY: &str = "free_instances";

/// The persisted form of one subarray's machines, written after every
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub recproc_state: String,
    pub freesub_state: String,
    pub subscribed: Vec<Instance>,
    pub ready: Vec<Instance>,
    pub recording: Vec<Instance>,
    pub processing: Vec<Instance>,
}

impl Snapshot {
    pub fn state_key(array: &str) -> String {
        format!("{array}:state")
    }
}

/// Writes or updates the current state for the specified array.
pub async fn save_snapshot(store: &dyn KeyValueStore, array: &str, snap: &Snapshot) -> Result<()> {
    let payload = serde_json::to_string(snap)?;
    store.set(&Snapshot::state_key(array), &payload).await?;
    store
        .set(&format!("{array}:freesub_state"), &snap.freesub_state)
        .await?;
    Ok(())
}

/// Reads the persisted state for an array, if any.
pub async fn load_snapshot(store: &dyn KeyValueStore, array: &str) -> Result<Option<Snapshot>> {
    match store.get(&Snapshot::state_key(array)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Saves the set of globally available, unassigned instances.
pub async fn save_free(store: &dyn KeyValueStore, free: &InstanceSet) -> Result<()> {
    let names: Vec<String> = free.iter().map(|i| i.to_string()).collect();
    store
        .set(FREE_INSTANCES_KEY, &serde_json::to_string(&names)?)
        .await
}

/// Retrieves the persisted free set, if any.
pub async fn load_free(store: &dyn KeyValueStore) -> Result<Option<InstanceSet>> {
    let Some(raw) = store.get(FREE_INSTANCES_KEY).await? else {
        return Ok(None);
    };
    let names: Vec<String> = serde_json::from_str(&raw)?;
    let mut set = InstanceSet::new();
    for name in names {
        set.insert(name.parse::<Instance>()?);
    }
    Ok(Some(set))
}

/// Administrative reset: clears the free set and every per-array snapshot so
/// the machines initialize to defaults on the next start.
pub async fn clear(store: &dyn KeyValueStore, arrays: &[String]) -> Result<u64> {
    let mut cleared = store.del(FREE_INSTANCES_KEY).await?;
    for array in arrays {
        cleared += store.del(&Snapshot::state_key(array)).await?;
        cleared += store.del(&format!("{array}:freesub_state")).await?;
    }
    info!("{cleared} state keys cleared");
    Ok(cleared)
}
