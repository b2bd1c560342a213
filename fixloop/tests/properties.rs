//! Property tests for timeout growth and port allocation.

use std::collections::BTreeSet;
use std::time::Duration;

use fixloop::core::budget::TimeoutPolicy;
use fixloop::io::ports::{PortAllocator, PortGrant};
use proptest::prelude::*;

const SCAN_WINDOW: u16 = 64;

// Reserved and free ports are offsets inside the scan window; the fallback sits past it.
fn allocator_case() -> impl Strategy<Value = (u16, u16, BTreeSet<u16>, BTreeSet<u16>)> {
    (
        1024u16..60_000,
        1u16..=SCAN_WINDOW,
        proptest::collection::btree_set(0u16..SCAN_WINDOW, 5..24),
        proptest::collection::btree_set(0u16..SCAN_WINDOW, 0..32),
    )
        .prop_map(|(base, scan_limit, reserved, free)| {
            let reserved = reserved.into_iter().map(|o| base + o).collect();
            let free = free.into_iter().map(|o| base + o).collect();
            (base, scan_limit, reserved, free)
        })
}

proptest! {
    #[test]
    fn timeouts_never_shrink_and_never_exceed_cap(
        base in 0u64..1_000,
        step in 0u64..1_000,
        cap in 0u64..3_000,
        index in 0u32..50,
    ) {
        let policy = TimeoutPolicy::new(
            Duration::from_secs(base),
            Duration::from_secs(step),
            Duration::from_secs(cap),
        );
        let current = policy.timeout_for(index);
        prop_assert!(current <= policy.timeout_for(index + 1));
        prop_assert!(current <= Duration::from_secs(cap));
        if base + step * u64::from(index) <= cap {
            prop_assert_eq!(current, Duration::from_secs(base + step * u64::from(index)));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10_000))]

    #[test]
    fn allocator_never_hands_out_reserved_or_duplicate_ports(
        (base, scan_limit, reserved, free) in allocator_case()
    ) {
        let fallback = base + SCAN_WINDOW + 1;
        let probe_free = free.clone();
        let ports = PortAllocator::new(
            base,
            scan_limit,
            fallback,
            reserved.clone(),
            Box::new(move |port: u16| probe_free.contains(&port)),
        )
        .expect("allocator");

        let mut granted = BTreeSet::new();
        let mut fallback_used = false;
        for _ in 0..=scan_limit + 1 {
            match ports.allocate() {
                Ok(grant) => {
                    let port = grant.port();
                    prop_assert!(!reserved.contains(&port), "reserved port {} granted", port);
                    prop_assert!(granted.insert(port), "port {} granted twice", port);
                    if let PortGrant::Scanned(port) = grant {
                        prop_assert!(free.contains(&port));
                        prop_assert!(port >= base && port < base + scan_limit);
                    } else {
                        prop_assert!(!fallback_used);
                        fallback_used = true;
                    }
                }
                Err(_) => prop_assert!(fallback_used),
            }
        }
    }
}
