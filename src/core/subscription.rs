// src/core/subscription.rs

//! The subscribe/unsubscribe sequencing run on entry to the SUBSCRIBED and
//! FREE states: gateway group membership, metadata fan-out, multicast
//! apportioning and DAQ pipeline restarts.

use crate::core::analyzer::ControlCommand;
use crate::core::context::Context;
use crate::core::gateway::Gateway;
use crate::core::instance::{Instance, InstanceSet};
use crate::core::multicast::{self, SpeadEndpoint};
use crate::core::{CoordinatorError, util};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Settle time after zeroing DESTIP before restarting the pipelines.
const UNSUBSCRIBE_SETTLE: Duration = Duration::from_secs(3);
/// Recovery time for restarted DAQ pipelines before the instances are
/// returned to the free pool.
const PIPELINE_RESTART_WAIT: Duration = Duration::from_secs(20);

/// Pause between per-instance key publishes.
const INSTANCE_KEY_PAUSE: Duration = Duration::from_millis(500);

/// The number of DAQ instances sufficient to process the full bandwidth for
/// the current subarray.
pub async fn num_requested(ctx: &Context, array: &str) -> Result<usize> {
    let endpoint = SpeadEndpoint::parse(&ctx.resolver.stream_endpoints(array).await?)?;
    Ok(endpoint.instances_required(ctx.config.streams_per_instance))
}

/// Allocates instances to a newly configured subarray: joins the gateway
/// groups, apportions the multicast groups and publishes all recording
/// metadata the DAQs need ahead of the first track.
pub async fn subscribe(ctx: &Context, array: &str, instances: &InstanceSet) -> Result<()> {
    ctx.alerts
        .annotate("CONFIGURE", &format!("{array}: Coordinator configuring DAQs."))
        .await;

    // A fresh configuration invalidates any previously retrieved calibration
    // solutions.
    ctx.store.set(&format!("{array}:last-cal"), "0").await?;
    ctx.store
        .set(
            &format!("{array}:last-config"),
            &format!("{}", Utc::now().timestamp()),
        )
        .await?;

    ctx.gateway.join_groups(array, instances).await?;

    let endpoint = SpeadEndpoint::parse(&ctx.resolver.stream_endpoints(array).await?)?;
    let spi = ctx.config.streams_per_instance;
    if endpoint.n_addrs > spi * instances.len() {
        let extra = endpoint.n_addrs - spi * instances.len();
        warn!("Too many streams: {extra} will not be processed.");
    }
    let allocation = multicast::allocate_groups(&endpoint, instances.len(), spi);

    // Array-wide gateway keys, each verified against the expected listener
    // count.
    let gw = &ctx.gateway;
    gw.set_array_key(array, instances, "SUBARRAY", array).await?;
    gw.set_array_key(array, instances, "BINDPORT", &allocation.port.to_string())
        .await?;
    gw.set_array_key(array, instances, "FENSTRM", &allocation.n_addrs.to_string())
        .await?;

    let t_sync = ctx.resolver.sync_time(array).await?;
    gw.set_array_key(array, instances, "SYNCTIME", &t_sync.to_string())
        .await?;

    let fecenter = ctx.resolver.centre_freq(array).await?;
    gw.set_array_key(array, instances, "FECENTER", &fecenter).await?;

    let n_freq_chans = ctx.resolver.n_channels(array).await?;
    gw.set_array_key(array, instances, "FENCHAN", &n_freq_chans)
        .await?;

    let chan_bw = ctx.resolver.coarse_chan_bw(array, &n_freq_chans).await?;
    gw.set_array_key(array, instances, "CHAN_BW", &chan_bw).await?;

    let hnchan = ctx.resolver.hnchan(array).await?;
    gw.set_array_key(array, instances, "HNCHAN", &hnchan).await?;

    let hntime = ctx.resolver.hntime(array).await?;
    gw.set_array_key(array, instances, "HNTIME", &hntime).await?;

    let adc_per_heap = ctx.resolver.samples_per_heap(array, &hntime).await?;
    gw.set_array_key(array, instances, "HCLOCKS", &adc_per_heap.to_string())
        .await?;

    let nants = ctx.resolver.nants(array).await?;
    gw.set_array_key(array, instances, "NANTS", &nants.to_string())
        .await?;

    // DWELL and PKTSTART stay zeroed until a track arrives.
    gw.set_array_key(array, instances, "DWELL", "0").await?;
    gw.set_array_key(array, instances, "PKTSTART", "0").await?;

    // The timing keys consumed by the PKTIDX-to-timestamp conversion.
    ctx.resolver
        .write_timing_keys(array, adc_per_heap, t_sync, &n_freq_chans, &chan_bw)
        .await?;

    // SCHAN, NSTRM and DESTIP per instance. The absolute starting channel is
    // a full block per preceding instance even when the final instance is
    // not completely filled.
    let hnchan_n: usize = hnchan
        .trim()
        .parse()
        .map_err(|_| CoordinatorError::MissingKey(format!("{array} HNCHAN unparseable")))?;
    for (i, instance) in instances.iter().enumerate() {
        let nstrm = if i == instances.len() - 1 {
            allocation.n_last + 1
        } else {
            spi
        };
        ctx.gateway
            .set_instance_key(instance, "NSTRM", &nstrm.to_string())
            .await?;
        let schan = i * spi * hnchan_n;
        ctx.gateway
            .set_instance_key(instance, "SCHAN", &schan.to_string())
            .await?;
        ctx.gateway
            .set_instance_key(instance, "DESTIP", &allocation.addr_list[i])
            .await?;
        tokio::time::sleep(INSTANCE_KEY_PAUSE).await;
    }

    // Alert the beamformer-recipe generator to the active instance list.
    write_allocated_hosts(ctx, array, instances).await?;

    ctx.alerts
        .alert(&format!(":arrow_forward: `{array}` instances subscribed"))
        .await;
    Ok(())
}

/// Ensures the given instances leave their multicast groups and restarts
/// their pipelines before they rejoin the free pool.
pub async fn unsubscribe(ctx: &Context, array: &str, instances: &InstanceSet) -> Result<()> {
    ctx.alerts
        .annotate(
            "UNSUBSCRIBE",
            &format!("{array}: Coordinator instructing DAQs to unsubscribe."),
        )
        .await;

    // Zero DESTIP and DWELL individually for robustness; mirrored into the
    // channel hash so late gateways see the final values.
    for instance in instances {
        let channel = ctx.gateway.instance_set_channel(instance);
        ctx.gateway
            .publish_key(&channel, "DESTIP", "0.0.0.0", true)
            .await?;
        ctx.gateway.publish_key(&channel, "DWELL", "0", true).await?;
    }
    tokio::time::sleep(UNSUBSCRIBE_SETTLE).await;
    ctx.alerts
        .alert(&format!(":eject: `{array}` unsubscribed"))
        .await;

    // Belt and braces restart of the DAQ pipelines and their gateways.
    let failed = restart_process(ctx, instances, "bluse_hashpipe").await;
    if failed.is_empty() {
        ctx.alerts
            .alert(&format!(":repeat: `{array}` restarted DAQs"))
            .await;
    } else {
        ctx.alerts
            .alert(&format!(
                ":x: `{array}` failed to restart DAQs: {}",
                join_instances(&failed)
            ))
            .await;
    }

    let failed = restart_process(ctx, instances, "bluse_redisgw").await;
    if failed.is_empty() {
        ctx.alerts
            .alert(&format!(":repeat: `{array}` restarted gateways"))
            .await;
    } else {
        ctx.alerts
            .alert(&format!(
                ":x: `{array}` failed to restart gateways: {}",
                join_instances(&failed)
            ))
            .await;
    }

    let numbers = Gateway::group_numbers(instances);
    ctx.gateway.destroy_groups(array, &numbers).await?;
    info!("Disbanded gateway group: {array}");

    clear_allocated_hosts(ctx, array).await?;

    // Give the restarted pipelines time to recover before reuse.
    tokio::time::sleep(PIPELINE_RESTART_WAIT).await;
    Ok(())
}

/// Restarts `<process>_<n>` on each instance's host. Returns the instances
/// whose supervisor did not acknowledge.
pub async fn restart_process(
    ctx: &Context,
    instances: &InstanceSet,
    process: &str,
) -> Vec<Instance> {
    let mut failed = Vec::new();
    for instance in instances {
        let process_name = format!("{}_{}", process, instance.number());
        info!("Restarting {process_name}");
        if !ctx
            .control
            .control(instance.host(), &process_name, ControlCommand::Restart)
            .await
        {
            failed.push(instance.clone());
        }
    }
    failed
}

/// Compatibility list for the `bfr5_generator`: the instances for which
/// beamformer recipe files should be generated.
async fn write_allocated_hosts(ctx: &Context, array: &str, instances: &InstanceSet) -> Result<()> {
    let key = format!("coordinator:allocated_hosts:{array}");
    ctx.store.del(&key).await?;
    let names: Vec<String> = instances.iter().map(|i| i.to_string()).collect();
    ctx.store.rpush(&key, &names).await?;
    Ok(())
}

async fn clear_allocated_hosts(ctx: &Context, array: &str) -> Result<()> {
    util::log_error(
        "clearing allocated host list",
        ctx.store
            .del(&format!("coordinator:allocated_hosts:{array}"))
            .await,
    );
    Ok(())
}

fn join_instances(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
