mod common;

use bluse_coordinator::core::metadata::MetadataResolver;
use bluse_coordinator::core::multicast::{SpeadEndpoint, allocate_groups};
use bluse_coordinator::core::recording::parse_target;
use common::{ARRAY, MemoryStore};
use proptest::prelude::*;

proptest! {
    /// The PKTIDX -> timestamp mapping is monotone in PKTIDX for fixed sync
    /// parameters, regardless of the channel bandwidth sign.
    #[test]
    fn prop_pktidx_to_timestamp_monotone(
        pktidx in 0i64..1_000_000_000,
        delta in 1i64..1_000_000,
        negative_bw in any::<bool>(),
    ) {
        tokio_test::block_on(async move {
            let store = MemoryStore::new();
            store.seed(&format!("{ARRAY}:hclocks"), "2097152");
            store.seed(&format!("{ARRAY}:synctime"), "1600000000");
            store.seed(&format!("{ARRAY}:fenchan"), "4096");
            let bw = if negative_bw { "-0.208984375" } else { "0.208984375" };
            store.seed(&format!("{ARRAY}:chan_bw"), bw);
            let resolver = MetadataResolver::new(store);

            let t1 = resolver.pktidx_to_timestamp(ARRAY, pktidx).await.unwrap();
            let t2 = resolver
                .pktidx_to_timestamp(ARRAY, pktidx + delta)
                .await
                .unwrap();
            prop_assert!(t2 > t1);
            Ok(())
        })?;
    }

    /// Extracted (name, ra, dec) survive re-emission into the gateway keys:
    /// parsing the re-emitted form is a fixed point.
    #[test]
    fn prop_target_parse_round_trips(
        name in "[A-Za-z0-9][A-Za-z0-9 .()+|-]{0,29}",
    ) {
        prop_assume!(!name.trim().is_empty());
        let raw = format!("{name}, radec, 9:18:05.28, -12:05:48.9");
        let Ok(first) = parse_target(&raw, 16, '|') else {
            // Names reducing to nothing after the delimiter split are not
            // re-emitted at all.
            return Ok(());
        };
        let reemitted = format!(
            "{}, radec, {}, {}",
            first.name, first.ra, first.dec
        );
        let second = parse_target(&reemitted, 16, '|').unwrap();
        prop_assert_eq!(second.name, first.name.trim());
        prop_assert_eq!(second.ra, first.ra);
        prop_assert_eq!(second.dec, first.dec);
    }

    /// Apportioning conserves streams: every address is handed to exactly
    /// one instance, and oversubscription drops only the tail.
    #[test]
    fn prop_allocation_conserves_streams(
        count in 0usize..255,
        n_instances in 1usize..32,
        streams_per_instance in 1usize..8,
    ) {
        let ep = SpeadEndpoint::parse(&format!("spead://239.9.0.0+{count}:7148")).unwrap();
        let n_addrs = count + 1;
        let alloc = allocate_groups(&ep, n_instances, streams_per_instance);

        let mut total = 0usize;
        let mut expected_octet = 0u32;
        for destip in &alloc.addr_list {
            let (addr, extra) = destip.rsplit_once('+').unwrap();
            let (_, octet) = addr.rsplit_once('.').unwrap();
            // Blocks are contiguous and in order.
            prop_assert_eq!(octet.parse::<u32>().unwrap(), expected_octet);
            let block = extra.parse::<usize>().unwrap() + 1;
            prop_assert!(block <= streams_per_instance);
            expected_octet += streams_per_instance as u32;
            total += block;
        }
        let capacity = streams_per_instance * n_instances;
        prop_assert_eq!(total, n_addrs.min(capacity));
        prop_assert!(alloc.addr_list.len() <= n_instances);
    }
}
