// src/core/recording.rs

//! Record-entry sequencing: target resolution, synchronized packet-start
//! computation, gateway metadata fan-out and the recording timeout timer.

use crate::core::calibration;
use crate::core::context::Context;
use crate::core::instance::{Instance, InstanceSet};
use crate::core::{CoordinatorError, util};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Standard recording length in seconds, sized to fill the buffers.
pub const DEFAULT_DWELL: u64 = 290;
/// Safety margin (in packets) added to the newest observed PKTIDX.
pub const PKTIDX_MARGIN: i64 = 2048;
/// Channel on which the target selector listens for new pointings.
pub const TARGETS_CHANNEL: &str = "target-selector:pointings";
/// Channel carrying recording timeouts back into the event loop.
pub const REC_RESULT_CHANNEL: &str = "rec_result";
/// Recordings shorter than this are not worth processing.
pub const MIN_RECORDING_SECONDS: f64 = 150.0;

/// Base recording timeout: DWELL plus a 10 second safety margin.
const REC_TIMEOUT_BASE: f64 = 300.0;
/// Maximum length for a target name in raw/filterbank headers.
const TARGET_NAME_LENGTH: usize = 16;
/// Attempts/spacing for resolving the current target.
const TARGET_RETRIES: usize = 5;
const TARGET_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Attempts/spacing for the per-buffer DATADIR publish.
const DATADIR_RETRIES: usize = 6;
const DATADIR_RETRY_DELAY: Duration = Duration::from_millis(300);

/// A parsed CBF target: header-safe name plus sexagesimal coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetData {
    pub name: String,
    pub ra: String,
    pub dec: String,
}

/// The computed packet-start and its wall-clock equivalents.
#[derive(Debug, Clone, PartialEq)]
pub struct PktstartData {
    pub pktstart: i64,
    pub ts: f64,
    /// UTC label of the form `YYYYMMDDThhmmssZ`, used in DATADIR and OBSID.
    pub label: String,
}

/// Everything the Rec/Proc machine needs after a successful record entry.
pub struct RecordResult {
    pub instances: InstanceSet,
    pub timer: JoinHandle<()>,
    pub primary_time: bool,
}

/// Parses a CBF target description of the form
/// `"<name> | <alias> | ..., radec, <ra>, <dec>"`.
///
/// All contents of the name up to `delimiter` are kept; punctuation other
/// than `+` and `-` becomes `_` for header compatibility, and the name is
/// truncated to `length` characters.
pub fn parse_target(raw: &str, length: usize, delimiter: char) -> Result<TargetData> {
    let target = raw.trim_matches('\'');
    if !target.contains("radec") {
        // We are unsure of the target format since no radec field is given.
        return Err(CoordinatorError::BadTarget(raw.to_string()));
    }
    let fields: Vec<&str> = target.split(',').collect();
    if fields.len() < 4 {
        // Name or description missing.
        warn!("Target name not provided.");
        if fields.len() < 3 {
            return Err(CoordinatorError::BadTarget(raw.to_string()));
        }
        return Ok(TargetData {
            name: "NOT_PROVIDED".to_string(),
            ra: fields[1].trim().to_string(),
            dec: fields[2].trim().to_string(),
        });
    }
    let name = fields[0]
        .split(delimiter)
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches(',');
    let name: String = name
        .chars()
        .map(|c| {
            // + and - are kept: they are significant in catalogue names.
            if c.is_ascii_punctuation() && c != '+' && c != '-' {
                '_'
            } else {
                c
            }
        })
        .take(length)
        .collect();
    Ok(TargetData {
        name,
        ra: fields[2].trim().to_string(),
        dec: fields[3].trim().to_string(),
    })
}

/// Attempts to determine the current track's target, with a staleness guard:
/// if the target value was last updated during the preceding track it must
/// not be used. A target is accepted when it is newer than
/// `last_track_end - 10`.
pub async fn resolve_target(ctx: &Context, array: &str) -> Result<TargetData> {
    let (target, target_ts, last_track_end) = ctx.resolver.target(array).await?;
    info!("Target: {target}, ts: {target_ts}, last: {last_track_end}");
    if target_ts < last_track_end - 10.0 {
        warn!("No target data yet for current track for {array}.");
        return Err(CoordinatorError::StaleTarget(array.to_string()));
    }
    parse_target(&target, TARGET_NAME_LENGTH, '|')
}

/// Reads PKTIDX from one instance's status hash. Instances whose network
/// thread is idle, or which do not report PKTIDX, are skipped.
pub async fn get_pkt_idx(ctx: &Context, instance: &Instance) -> Result<Option<i64>> {
    let key = ctx.gateway.status_key(instance);
    let status = ctx.store.hgetall(&key).await?;
    if status.is_empty() {
        warn!("Cannot acquire {key}");
        return Ok(None);
    }
    match status.get("NETSTAT") {
        None => {
            warn!("NETSTAT is missing for {key}");
            Ok(None)
        }
        Some(netstat) if netstat == "idle" => Ok(None),
        Some(_) => match status.get("PKTIDX") {
            Some(idx) => Ok(Some(idx.trim().parse()?)),
            None => {
                warn!("PKTIDX is missing for {key}");
                Ok(None)
            }
        },
    }
}

/// Calculates PKTSTART for the given instances: the newest observed packet
/// index plus a safety margin, rejected when its wall-clock equivalent is
/// implausible.
pub async fn compute_pktstart(
    ctx: &Context,
    array: &str,
    instances: &InstanceSet,
) -> Result<PktstartData> {
    let mut pkt_indices = Vec::new();
    for instance in instances {
        if let Some(idx) = get_pkt_idx(ctx, instance).await? {
            pkt_indices.push(idx);
        }
    }
    if pkt_indices.is_empty() {
        warn!("Could not retrieve PKTIDX for {array}");
        return Err(CoordinatorError::NoActiveInstances(array.to_string()));
    }

    let max_idx = *pkt_indices.iter().max().expect("non-empty");
    let min_idx = *pkt_indices.iter().min().expect("non-empty");
    let pktstart = max_idx + PKTIDX_MARGIN;

    let max_ts = ctx.resolver.pktidx_to_timestamp(array, max_idx).await?;
    let min_ts = ctx.resolver.pktidx_to_timestamp(array, min_idx).await?;
    let ts = ctx.resolver.pktidx_to_timestamp(array, pktstart).await?;
    info!("PKTIDX: Min {min_ts}, Max {max_ts}, PKTSTART {ts}");

    let pktstart_dt = DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .ok_or_else(|| CoordinatorError::BadPktstart(array.to_string()))?;
    let label = pktstart_dt.format("%Y%m%dT%H%M%SZ").to_string();

    // Reject wall-clock skew beyond two minutes.
    let skew = (ts - Utc::now().timestamp() as f64).abs();
    if skew > 120.0 {
        warn!("bad pktstart: {label} for {array}");
        ctx.alerts
            .alert(&format!(":warning: `{array}` bad pktstart"))
            .await;
        return Err(CoordinatorError::BadPktstart(array.to_string()));
    }

    Ok(PktstartData {
        pktstart,
        ts,
        label,
    })
}

/// The recording directory for one buffer index.
pub fn datadir(instance_number: u8, pktstart_label: &str, sb_id: &str) -> String {
    format!("/buf{instance_number}/{pktstart_label}-{sb_id}")
}

/// Publishes DATADIR per instance-number group: instance 0 must always use
/// `/buf0`, instance 1 `/buf1`. Verified against the expected listener count
/// with its own (tighter) retry cadence.
pub async fn set_datadir(
    ctx: &Context,
    array: &str,
    pktstart_label: &str,
    numbers: &[u8],
    sb_id: &str,
    expected: usize,
) -> Result<usize> {
    let mut listeners = 0;
    for attempt in 0..DATADIR_RETRIES {
        listeners = 0;
        for n in numbers {
            let group = format!("{array}-{n}");
            let channel = ctx.gateway.group_set_channel(&group);
            let dir = datadir(*n, pktstart_label, sb_id);
            listeners += ctx.gateway.publish_key(&channel, "DATADIR", &dir, false).await?;
        }
        info!("Listeners for datadir: {listeners}");
        if listeners >= expected {
            if attempt > 0 {
                ctx.alerts
                    .alert(&format!(":ballot_box_with_check: `{array}` retry `DATADIR` success"))
                    .await;
            }
            return Ok(listeners);
        }
        let missing = expected - listeners;
        ctx.alerts
            .alert(&format!(
                ":warning: `{array}` DATADIR unset for {missing} instance(s)"
            ))
            .await;
        ctx.alerts
            .alert(&format!(":fast_forward: `{array}` retry `DATADIR`"))
            .await;
        tokio::time::sleep(DATADIR_RETRY_DELAY).await;
    }
    Ok(listeners)
}

/// Writes the recording record so that other processes (e.g. the analyzer
/// and the target selector) can look up what was captured.
pub async fn write_metadata(
    ctx: &Context,
    instance: &Instance,
    array: &str,
    pktstart_ts: f64,
    obsid: &str,
    dwell: u64,
    pktstart_label: &str,
    sb_id: &str,
) -> Result<()> {
    let nants = ctx.resolver.nants(array).await?;
    let band = ctx.resolver.band(array).await.unwrap_or_default();
    let dir = datadir(instance.number(), pktstart_label, sb_id);
    let record = json!({
        "band": band,
        "start_ts": pktstart_ts,
        "nants": nants,
        "obsid": obsid,
    });
    // Link subarray to its current datadir.
    ctx.store.set(&format!("{array}:datadir"), &dir).await?;
    ctx.store
        .set(&format!("metadata:{dir}"), &record.to_string())
        .await?;
    // Predicted stop time.
    ctx.store
        .set(&format!("rec_end:{dir}"), &format!("{}", pktstart_ts + dwell as f64))
        .await?;
    Ok(())
}

/// Requests a new target list from the external target selector.
pub async fn request_targets(
    ctx: &Context,
    array: &str,
    pktstart_label: &str,
    target: &str,
    ra_deg: f64,
    dec_deg: f64,
) -> Result<()> {
    info!("Targets requested for: {pktstart_label}");
    let band = ctx.resolver.band(array).await.unwrap_or_default();
    let fecenter: f64 = ctx.resolver.centre_freq(array).await?.parse()?;
    let f_max = fecenter + ctx.resolver.bandwidth_mhz(array).await.unwrap_or(0.0) / 2.0;
    let details = json!({
        "telescope": ctx.config.telescope_name,
        "array": array,
        "pktstart_str": pktstart_label,
        "target": target,
        "ra_deg": ra_deg,
        "dec_deg": dec_deg,
        "f_max": f_max,
        "band": band,
    });
    let msg = format!("POINTING:{details}");
    ctx.store.publish(TARGETS_CHANNEL, &msg).await?;
    info!("Requested targets on {TARGETS_CHANNEL}: {msg}");
    Ok(())
}

/// Queues the recording for analysis on each instance.
pub async fn add_unprocessed(
    ctx: &Context,
    instances: &InstanceSet,
    pktstart_label: &str,
    sb_id: &str,
) -> Result<()> {
    info!("Adding datadir to <instance>:unprocessed");
    for instance in instances {
        let dir = datadir(instance.number(), pktstart_label, sb_id);
        ctx.store
            .lpush(&format!("{instance}:unprocessed"), &dir)
            .await?;
    }
    Ok(())
}

/// Marks the recording for preservation: primary-time data must survive the
/// analyzer's cleanup pass.
pub async fn add_preserved(
    ctx: &Context,
    instances: &InstanceSet,
    pktstart_label: &str,
    sb_id: &str,
) -> Result<()> {
    for instance in instances {
        let dir = datadir(instance.number(), pktstart_label, sb_id);
        ctx.store
            .lpush(&format!("{instance}:preserved"), &dir)
            .await?;
    }
    Ok(())
}

/// Whether the recording under `dir` ran for less than `min_duration`
/// seconds, judged from its metadata record and recorded end time.
pub async fn too_short(ctx: &Context, dir: &str, min_duration: f64) -> bool {
    let Ok(Some(meta)) = ctx.store.get(&format!("metadata:{dir}")).await else {
        return false;
    };
    let Ok(meta) = serde_json::from_str::<serde_json::Value>(&meta) else {
        warn!("Invalid JSON in metadata for {dir}");
        return false;
    };
    let Some(start_ts) = meta.get("start_ts").and_then(|v| v.as_f64()) else {
        warn!("Missing key start_ts for {dir}");
        return false;
    };
    let Ok(Some(end)) = ctx.store.get(&format!("rec_end:{dir}")).await else {
        return false;
    };
    let Ok(end_ts) = end.parse::<f64>() else {
        return false;
    };
    end_ts - start_ts < min_duration
}

/// Starts and checks recording for the current track. Calibration solutions
/// are retrieved in the background after a 60 second delay, which is needed
/// for the solutions provided by Telstate to be current.
pub async fn record(ctx: &Arc<Context>, array: &str, instances: &InstanceSet) -> Result<RecordResult> {
    let n_inst = instances.len();

    // Current target, retried while the telescope metadata catches up.
    let target_data = {
        let ctx_ref = &*ctx;
        util::retry(TARGET_RETRIES, TARGET_RETRY_DELAY, || {
            resolve_target(ctx_ref, array)
        })
        .await
        .ok_or_else(|| CoordinatorError::StaleTarget(array.to_string()))?
    };

    calibration::spawn_deferred(ctx.clone(), array.to_string());

    // Arm DWELL ahead of the packet start.
    ctx.gateway
        .set_array_key(array, instances, "DWELL", &DEFAULT_DWELL.to_string())
        .await?;

    let pktstart = compute_pktstart(ctx, array, instances).await?;

    // FECENTER must be available before committing to the recording.
    ctx.resolver.centre_freq(array).await?;

    let sb_id = ctx.resolver.sb_id(array).await?;
    let numbers: Vec<u8> = crate::core::gateway::Gateway::group_numbers(instances)
        .into_iter()
        .collect();
    set_datadir(ctx, array, &pktstart.label, &numbers, &sb_id, n_inst).await?;

    ctx.gateway
        .set_array_key(array, instances, "SRC_NAME", &target_data.name)
        .await?;

    // RA and Dec at the start of the observation.
    let ra_d = util::ra_degrees(&target_data.ra)?;
    ctx.gateway
        .set_array_key(array, instances, "RA", &ra_d.to_string())
        .await?;
    ctx.gateway
        .set_array_key(array, instances, "RA_STR", &target_data.ra)
        .await?;
    let dec_d = util::dec_degrees(&target_data.dec)?;
    ctx.gateway
        .set_array_key(array, instances, "DEC", &dec_d.to_string())
        .await?;
    ctx.gateway
        .set_array_key(array, instances, "DEC_STR", &target_data.dec)
        .await?;

    // OBSID: unique identifier for this recording.
    let obsid = format!("{}:{}:{}", ctx.config.telescope_name, array, pktstart.label);
    ctx.gateway
        .set_array_key(array, instances, "OBSID", &obsid)
        .await?;

    // PKTSTART goes last so the DAQs begin recording synchronously once all
    // other keys have been delivered.
    ctx.gateway
        .set_array_key(array, instances, "PKTSTART", &pktstart.pktstart.to_string())
        .await?;

    ctx.alerts
        .annotate("RECORD", &format!("{array}, OBSID: {obsid}"))
        .await;

    util::log_error(
        "requesting targets",
        request_targets(ctx, array, &pktstart.label, &target_data.name, ra_d, dec_d).await,
    );

    let primary_time = ctx
        .resolver
        .is_primary_time(array, &ctx.config.primary_proposal_id)
        .await;
    if primary_time {
        info!("Primary time detected.");
        ctx.alerts
            .alert(&format!(
                ":zap: `{array}` Primary time detected, human intervention required after recording"
            ))
            .await;
        add_preserved(ctx, instances, &pktstart.label, &sb_id).await?;
    } else {
        add_unprocessed(ctx, instances, &pktstart.label, &sb_id).await?;
    }

    for instance in instances {
        write_metadata(
            ctx,
            instance,
            array,
            pktstart.ts,
            &obsid,
            DEFAULT_DWELL,
            &pktstart.label,
            &sb_id,
        )
        .await?;
    }

    // Recording timeout timer with a 10 second safety margin past DWELL.
    let pktstart_delay = pktstart.ts - Utc::now().timestamp() as f64;
    ctx.alerts
        .alert(&format!(":hourglass: `{array}` pktstart delay: {pktstart_delay}"))
        .await;
    let timer = spawn_rec_timeout(ctx.clone(), array.to_string(), REC_TIMEOUT_BASE + pktstart_delay);

    ctx.alerts
        .alert(&format!(":black_circle_for_record: `{array}` recording: `{obsid}`"))
        .await;

    Ok(RecordResult {
        instances: instances.clone(),
        timer,
        primary_time,
    })
}

/// Fallback timeout: publishes `rec-timeout:<array>` onto the recording
/// event channel after `delay_seconds`, so the machine leaves RECORD even if
/// the telescope never reports the track's end.
pub fn spawn_rec_timeout(ctx: Arc<Context>, array: String, delay_seconds: f64) -> JoinHandle<()> {
    info!("Starting recording timeout timer.");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs_f64(delay_seconds.max(0.0))).await;
        util::log_error(
            "publishing recording timeout",
            ctx.store
                .publish(REC_RESULT_CHANNEL, &format!("rec-timeout:{array}"))
                .await,
        );
    })
}
