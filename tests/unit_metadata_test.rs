mod common;

use bluse_coordinator::core::metadata::MetadataResolver;
use common::{ARRAY, MemoryStore, seed_subarray_sensors};

#[tokio::test]
async fn test_sensor_derived_gateway_values() {
    let store = MemoryStore::new();
    seed_subarray_sensors(&store).await;
    let resolver = MetadataResolver::new(store.clone());

    assert_eq!(resolver.nants(ARRAY).await.unwrap(), 16);
    assert_eq!(resolver.n_channels(ARRAY).await.unwrap(), "4096");
    assert_eq!(resolver.centre_freq(ARRAY).await.unwrap(), "1284");
    assert_eq!(
        resolver.coarse_chan_bw(ARRAY, "4096").await.unwrap(),
        "0.208984375"
    );
    assert_eq!(resolver.hnchan(ARRAY).await.unwrap(), "16");
    assert_eq!(resolver.hntime(ARRAY).await.unwrap(), "256");
    assert_eq!(
        resolver.samples_per_heap(ARRAY, "256").await.unwrap(),
        8192 * 256
    );
}

#[tokio::test]
async fn test_missing_sensor_is_an_error() {
    let store = MemoryStore::new();
    let resolver = MetadataResolver::new(store.clone());
    assert!(resolver.centre_freq(ARRAY).await.is_err());
    assert!(resolver.sync_time(ARRAY).await.is_err());
}

#[tokio::test]
async fn test_stream_endpoint_normalizes_python_repr() {
    let store = MemoryStore::new();
    seed_subarray_sensors(&store).await;
    let resolver = MetadataResolver::new(store.clone());
    assert_eq!(
        resolver.stream_endpoints(ARRAY).await.unwrap(),
        "spead://239.9.0.64+15:7148"
    );
}

#[tokio::test]
async fn test_sb_id_parsing() {
    let store = MemoryStore::new();
    let resolver = MetadataResolver::new(store.clone());

    store.seed(&format!("{ARRAY}:sched_observation_schedule_1"), "20221128-0003,next");
    assert_eq!(resolver.sb_id(ARRAY).await.unwrap(), "20221128-0003");

    store.seed(&format!("{ARRAY}:sched_observation_schedule_1"), "Unknown_SB");
    assert_eq!(resolver.sb_id(ARRAY).await.unwrap(), "Unknown_SB");

    store.seed(&format!("{ARRAY}:sched_observation_schedule_1"), "garbage");
    assert!(resolver.sb_id(ARRAY).await.is_err());
}

#[tokio::test]
async fn test_s_band_subband_resolved_by_centre_frequency() {
    let store = MemoryStore::new();
    seed_subarray_sensors(&store).await;
    let resolver = MetadataResolver::new(store.clone());

    assert_eq!(resolver.band(ARRAY).await.unwrap(), "l");

    store.seed(&format!("{ARRAY}:subarray_1_band"), "s");
    store.seed(
        &format!("{ARRAY}:subarray_1_streams_wide_antenna_channelised_voltage_centre_frequency"),
        "2625000000",
    );
    assert_eq!(resolver.band(ARRAY).await.unwrap(), "s2");
}

#[tokio::test]
async fn test_primary_time_detection() {
    let store = MemoryStore::new();
    let resolver = MetadataResolver::new(store.clone());

    assert!(!resolver.is_primary_time(ARRAY, "EXT-20220504-DM-01").await);

    store.seed(
        &format!("{ARRAY}:subarray_1_script_proposal_id"),
        "'EXT-20220504-DM-01'",
    );
    assert!(resolver.is_primary_time(ARRAY, "EXT-20220504-DM-01").await);
    assert!(!resolver.is_primary_time(ARRAY, "SCI-20230101-XX-01").await);
}

#[tokio::test]
async fn test_pktidx_to_timestamp_is_monotone() {
    let store = MemoryStore::new();
    store.seed(&format!("{ARRAY}:hclocks"), "2097152");
    store.seed(&format!("{ARRAY}:synctime"), "1600000000");
    store.seed(&format!("{ARRAY}:fenchan"), "4096");
    store.seed(&format!("{ARRAY}:chan_bw"), "-0.208984375");
    let resolver = MetadataResolver::new(store.clone());

    let t0 = resolver.pktidx_to_timestamp(ARRAY, 0).await.unwrap();
    assert!((t0 - 1_600_000_000.0).abs() < f64::EPSILON);
    let t1 = resolver.pktidx_to_timestamp(ARRAY, 100_000).await.unwrap();
    let t2 = resolver.pktidx_to_timestamp(ARRAY, 100_001).await.unwrap();
    assert!(t1 > t0);
    assert!(t2 > t1);

    // Negative indices are rejected.
    assert!(resolver.pktidx_to_timestamp(ARRAY, -1).await.is_err());
}
