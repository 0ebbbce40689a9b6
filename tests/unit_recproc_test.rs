mod common;

use bluse_coordinator::core::analyzer::ControlCommand;
use bluse_coordinator::core::client::KeyValueStore;
use bluse_coordinator::core::events::Event;
use bluse_coordinator::core::fsm::SubarrayData;
use bluse_coordinator::core::instance::Instance;
use bluse_coordinator::core::supervisor::SubarrayWorker;
use common::{
    ARRAY, INSTANCES, MemoryStore, RecordingControl, seed_recording_sensors,
    seed_subarray_sensors, test_config, test_context,
};
use std::sync::Arc;

fn assert_role_invariants(data: &SubarrayData) {
    assert!(data.ready.is_subset(&data.subscribed));
    assert!(data.recording.is_subset(&data.subscribed));
    assert!(data.processing.is_subset(&data.subscribed));
    assert!(data.ready.is_disjoint(&data.recording));
    assert!(data.ready.is_disjoint(&data.processing));
    assert!(data.recording.is_disjoint(&data.processing));
}

async fn subscribed_worker(
    store: &Arc<MemoryStore>,
    control: &Arc<RecordingControl>,
) -> SubarrayWorker {
    seed_subarray_sensors(store).await;
    let ctx = test_context(store.clone(), control.clone(), test_config());
    let mut worker = SubarrayWorker::create(ARRAY, ctx).await;
    worker.handle_event(&Event::Configure).await;
    worker.handle_event(&Event::Configured).await;
    assert_role_invariants(worker.data());
    worker
}

/// Full track and process: DWELL then PKTSTART published, analyzers started
/// for every instance, return codes summarized and n_proc incremented.
#[tokio::test(start_paused = true)]
async fn test_full_track_and_process() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);

    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "RECORD");
    assert_eq!(worker.data().recording.len(), 4);
    assert!(worker.data().ready.is_empty());
    assert_role_invariants(worker.data());

    // DWELL is armed before PKTSTART, and PKTSTART goes last.
    let group_msgs = store.published_on("bluse:array_1-0///set");
    let dwell_at = group_msgs.iter().position(|m| m == "DWELL=290").unwrap();
    let pktstart_at = group_msgs
        .iter()
        .position(|m| m.starts_with("PKTSTART=") && m != "PKTSTART=0")
        .unwrap();
    assert!(dwell_at < pktstart_at);
    assert_eq!(group_msgs.last().unwrap(), &format!("PKTSTART={}", 100_000 + 2048));

    // OBSID carries telescope, array and the pktstart label.
    let obsid_msg = group_msgs
        .iter()
        .find(|m| m.starts_with("OBSID="))
        .expect("OBSID published");
    assert!(obsid_msg.starts_with("OBSID=MeerKAT:array_1:"));

    // Each instance received the new recording in its work queue.
    for instance in INSTANCES {
        let queue = store.list(&format!("{instance}:unprocessed"));
        assert_eq!(queue.len(), 1);
        let n = instance.split('/').nth(1).unwrap();
        assert!(queue[0].starts_with(&format!("/buf{n}/")));
        assert!(queue[0].ends_with("-20230107-0012"));
    }

    // The recording ends by timeout.
    worker.handle_event(&Event::RecEnd).await;
    assert_eq!(worker.recproc_state_name(), "PROCESS");
    assert_eq!(worker.data().processing.len(), 4);
    assert_role_invariants(worker.data());

    // One analyzer start per instance.
    let commands = control.commands();
    for instance in INSTANCES {
        let (host, n) = instance.split_once('/').unwrap();
        assert!(
            commands.iter().any(|(h, p, c)| {
                h == host && p == &format!("bluse_analyzer_{n}") && *c == ControlCommand::Start
            }),
            "missing analyzer start for {instance}"
        );
    }

    // Results trickle in; stragglers keep the machine in PROCESS.
    worker.handle_event(&Event::Return {
        instance: "blpn0/0".parse().unwrap(),
        stage1: 0,
        stage2: -1,
    })
    .await;
    worker.handle_event(&Event::Return {
        instance: "blpn0/1".parse().unwrap(),
        stage1: 0,
        stage2: -1,
    })
    .await;
    assert_eq!(worker.recproc_state_name(), "PROCESS");
    assert_role_invariants(worker.data());

    worker.handle_event(&Event::Return {
        instance: "blpn1/0".parse().unwrap(),
        stage1: 1,
        stage2: 0,
    })
    .await;
    worker.handle_event(&Event::Return {
        instance: "blpn1/1".parse().unwrap(),
        stage1: 0,
        stage2: 0,
    })
    .await;

    assert_eq!(worker.recproc_state_name(), "READY");
    assert_eq!(worker.data().ready, worker.data().subscribed);
    assert!(worker.data().processing.is_empty());
    assert_role_invariants(worker.data());

    // Aggregate summary and the processing counter.
    assert!(store.published_containing("stage 1 complete: codes `0: 3` `1: 1`"));
    assert!(store.published_containing("stage 2 complete: codes"));
    assert_eq!(
        store.get("automator:n_proc").await.unwrap().as_deref(),
        Some("1")
    );
}

/// A RETURN for an instance not in any processing set is a no-op.
#[tokio::test(start_paused = true)]
async fn test_unknown_return_is_a_noop() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);

    worker.handle_event(&Event::Record).await;
    worker.handle_event(&Event::RecEnd).await;
    let before = worker.data().clone();

    worker.handle_event(&Event::Return {
        instance: "blpn9/0".parse::<Instance>().unwrap(),
        stage1: 0,
        stage2: -1,
    })
    .await;

    assert_eq!(worker.recproc_state_name(), "PROCESS");
    assert_eq!(worker.data(), &before);
}

/// A fatal analyzer result (rc >= 2) lands the machine in ERROR.
#[tokio::test(start_paused = true)]
async fn test_fatal_return_code_enters_error() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);

    worker.handle_event(&Event::Record).await;
    worker.handle_event(&Event::RecEnd).await;
    for (i, instance) in INSTANCES.iter().enumerate() {
        worker.handle_event(&Event::Return {
            instance: instance.parse().unwrap(),
            stage1: if i == 0 { 2 } else { 0 },
            stage2: -1,
        })
        .await;
    }

    assert_eq!(worker.recproc_state_name(), "ERROR");
    assert!(store.published_containing("ERROR"));

    // ERROR is a sink: further events are ignored.
    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "ERROR");
}

/// Early stop, non-primary: timer cancelled, DWELL reset sequence published,
/// then processing.
#[tokio::test(start_paused = true)]
async fn test_early_stop_resets_dwell_and_processes() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);

    worker.handle_event(&Event::Record).await;
    store.clear_published();

    worker.handle_event(&Event::TrackStop).await;
    assert_eq!(worker.recproc_state_name(), "PROCESS");
    assert_role_invariants(worker.data());

    // Per-instance DWELL drop and re-arm around the PKTSTART reset.
    for instance in INSTANCES {
        let msgs = store.published_on(&format!("bluse://{instance}/set"));
        let dwell0 = msgs.iter().position(|m| m == "DWELL=0").unwrap();
        let pkt0 = msgs.iter().position(|m| m == "PKTSTART=0").unwrap();
        let rearm = msgs.iter().position(|m| m == "DWELL=290").unwrap();
        assert!(dwell0 < pkt0 && pkt0 < rearm, "{instance}: {msgs:?}");
    }
    assert!(store.published_containing("recording stopped"));

    // The cancelled fallback timer never fires.
    tokio::time::sleep(std::time::Duration::from_secs(600)).await;
    assert!(store.published_on("rec_result").is_empty());
}

/// Primary-time hold: no analyzer start, instances back to ready, WAITING
/// until an operator intervenes.
#[tokio::test(start_paused = true)]
async fn test_primary_time_holds_in_waiting() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);
    store.seed(
        &format!("{ARRAY}:subarray_1_script_proposal_id"),
        "EXT-20220504-DM-01",
    );

    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "RECORD");
    assert!(store.published_containing("Primary time detected"));

    // The recording is preserved rather than queued for analysis.
    for instance in INSTANCES {
        assert!(store.list(&format!("{instance}:unprocessed")).is_empty());
        assert_eq!(store.list(&format!("{instance}:preserved")).len(), 1);
    }

    worker.handle_event(&Event::TrackStop).await;
    assert_eq!(worker.recproc_state_name(), "WAITING");
    assert_eq!(worker.data().ready, worker.data().subscribed);
    assert!(worker.data().recording.is_empty());
    assert!(store.published_containing("intervention required"));

    // No analyzer was started.
    assert!(
        !control
            .commands()
            .iter()
            .any(|(_, p, _)| p.starts_with("bluse_analyzer"))
    );

    // WAITING is a sink: a new track does not restart recording.
    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "WAITING");
}

/// Deconfigure mid-record: the Free/Subscribed machine unsubscribes and
/// releases the instances immediately, while the Rec/Proc machine remains in
/// RECORD until its timeout arrives.
#[tokio::test(start_paused = true)]
async fn test_deconfigure_mid_record() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);

    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "RECORD");
    store.clear_published();

    worker.handle_event(&Event::Deconfigure).await;

    // The subscription side has fully released the fleet...
    assert!(worker.data().subscribed.is_empty());
    assert_eq!(worker.data().recording.len(), 0);
    for instance in INSTANCES {
        let msgs = store.published_on(&format!("bluse://{instance}/set"));
        assert!(msgs.contains(&"DESTIP=0.0.0.0".to_string()));
    }

    // ...while the recording machine waits for its track to end.
    assert_eq!(worker.recproc_state_name(), "RECORD");
    worker.handle_event(&Event::RecEnd).await;
    assert_eq!(worker.recproc_state_name(), "PROCESS");
}

/// RECORD is refused while nothing is subscribed.
#[tokio::test(start_paused = true)]
async fn test_record_requires_subscription() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    seed_subarray_sensors(&store).await;
    let ctx = test_context(store.clone(), control.clone(), test_config());
    let mut worker = SubarrayWorker::create(ARRAY, ctx).await;

    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "READY");
    assert!(worker.data().recording.is_empty());
}

/// A stale target aborts the record entry and the machine stays READY.
#[tokio::test(start_paused = true)]
async fn test_stale_target_aborts_record_entry() {
    let store = MemoryStore::new();
    let control = RecordingControl::new();
    let mut worker = subscribed_worker(&store, &control).await;
    seed_recording_sensors(&store, 100_000);
    // The target was written well before the previous track ended.
    let now = chrono::Utc::now().timestamp() as f64;
    store.seed(&format!("{ARRAY}:last-target"), &(now - 1000.0).to_string());
    store.seed(&format!("{ARRAY}:last-track-end"), &now.to_string());

    worker.handle_event(&Event::Record).await;
    assert_eq!(worker.recproc_state_name(), "READY");
    assert!(worker.data().recording.is_empty());
    assert_eq!(worker.data().ready, worker.data().subscribed);
}
