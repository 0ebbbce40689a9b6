// src/core/processing.rs

//! Process-side helpers: analyzer dispatch, the aggregate processing
//! counter and return-code summaries.

use crate::core::CoordinatorError;
use crate::core::analyzer::ControlCommand;
use crate::core::client::KeyValueStore;
use crate::core::context::Context;
use crate::core::instance::{Instance, InstanceSet};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Counter of completed aggregate processing cycles across all subarrays.
const N_PROC_KEY: &str = "automator:n_proc";

/// Retrieves the absolute number of times processing has been run,
/// initializing the counter on first use.
pub async fn get_n_proc(store: &dyn KeyValueStore) -> Result<u64> {
    match store.get(N_PROC_KEY).await? {
        Some(n) => Ok(n.parse()?),
        None => {
            store.set(N_PROC_KEY, "0").await?;
            Ok(0)
        }
    }
}

/// Adds 1 to the number of times processing has been run.
pub async fn increment_n_proc(store: &dyn KeyValueStore) -> Result<()> {
    let n = get_n_proc(store).await?;
    store.set(N_PROC_KEY, &(n + 1).to_string()).await
}

/// Summarises analyzer return codes, e.g. ``codes `0: 3` `1: 1` ``.
pub fn output_summary(codes: &[i32]) -> String {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for code in codes {
        *counts.entry(*code).or_default() += 1;
    }
    let mut summary = String::from("codes ");
    for (code, count) in counts {
        summary.push_str(&format!("`{code}: {count}` "));
    }
    summary
}

/// Starts the analyzer for each instance. There may be more than one
/// instance per host; the analyzer process name carries the instance number.
pub async fn start_analyzers(ctx: &Context, instances: &InstanceSet) {
    for instance in instances {
        let process = format!("bluse_analyzer_{}", instance.number());
        if !ctx
            .control
            .control(instance.host(), &process, ControlCommand::Start)
            .await
        {
            error!("Could not start processing on {instance}");
        }
    }
}

/// Snapshots each instance's actual status-buffer DATADIR so the analyzer
/// can detect a mismatch against its work queue.
pub async fn snapshot_last_datadirs(ctx: &Context, instances: &InstanceSet) {
    for instance in instances {
        let dir = last_datadir(ctx, instance).await;
        if let Err(e) = ctx
            .store
            .set(&format!("{instance}:last-datadir"), &dir)
            .await
        {
            warn!("Could not record last datadir for {instance}: {e}");
        } else {
            info!("{instance}: last datadir: {dir}");
        }
    }
}

async fn last_datadir(ctx: &Context, instance: &Instance) -> String {
    let key = ctx.gateway.status_key(instance);
    match ctx.store.hget(&key, "DATADIR").await {
        Ok(Some(dir)) => dir,
        Ok(None) => {
            warn!("No DATADIR set for {instance}, recording as unknown");
            "unknown".to_string()
        }
        Err(e) => {
            warn!("Could not read status buffer for {instance}: {e}");
            "unknown".to_string()
        }
    }
}
