//! Property-based tests for the watcher's pure decision logic.

use proptest::prelude::*;
use std::time::Instant;
use vigil::watcher::addr::InstanceAddr;
use vigil::watcher::instance::{PrimaryOptions, parse_info};
use vigil::watcher::link::{CmdConn, LINK_QUEUE_DEPTH};
use vigil::watcher::scheduler::Coordinator;
use vigil::watcher::{TILT_PERIOD_MS, TILT_TRIGGER_MS};

fn addr(host: &str, port: u16) -> InstanceAddr {
    InstanceAddr {
        host: host.into(),
        ip: host.parse().ok(),
        port,
    }
}

fn coordinator_with_replicas(replicas: &[(u32, u64, String)]) -> Coordinator {
    let (mut c, _admin) = Coordinator::new("f1f2".repeat(10), addr("127.0.0.1", 26379), None);
    c.registry
        .create_primary("cache", addr("10.0.0.1", 6379), PrimaryOptions::default())
        .unwrap();
    let now = Instant::now();
    for (i, (priority, offset, run_id)) in replicas.iter().enumerate() {
        let key = c
            .registry
            .add_replica("cache", addr("10.1.0.1", 7000 + i as u16))
            .unwrap();
        let link = c.registry.primaries["cache"].replicas[&key].link;
        let (tx, rx) = tokio::sync::mpsc::channel(LINK_QUEUE_DEPTH);
        std::mem::forget(rx);
        c.registry.links.get_mut(link).unwrap().cmd = Some(CmdConn {
            tx,
            ready: true,
            connected_at: now,
        });
        let replica = c
            .registry
            .primaries
            .get_mut("cache")
            .unwrap()
            .replicas
            .get_mut(&key)
            .unwrap();
        replica.priority = *priority;
        replica.repl_offset = *offset;
        replica.run_id = Some(run_id.clone());
        replica.info_refresh = Some(now);
        replica.primary_link_up = true;
    }
    c
}

proptest! {
    /// The INFO parser accepts arbitrary bytes without panicking; monitored
    /// nodes are not trusted to produce a clean dialect.
    #[test]
    fn info_parser_never_panics(text in "\\PC{0,400}") {
        let _ = parse_info(&text);
    }

    /// Whatever the candidate set, the selected replica is minimal in the
    /// preference order (priority asc, offset desc, run id asc).
    #[test]
    fn promotion_target_is_minimal_in_preference_order(
        replicas in prop::collection::vec(
            (1u32..5, 0u64..1000, "[a-f0-9]{8}"),
            1..6,
        )
    ) {
        let c = coordinator_with_replicas(&replicas);
        let selected = c
            .select_promotion_target("cache", Instant::now())
            .expect("all candidates are eligible");

        let primary = &c.registry.primaries["cache"];
        let rank = |key: &str| {
            let r = &primary.replicas[key];
            (
                r.priority,
                std::cmp::Reverse(r.repl_offset),
                r.run_id.clone().unwrap_or_default(),
            )
        };
        let best = rank(&selected);
        for key in primary.replicas.keys() {
            prop_assert!(best <= rank(key));
        }
    }

    /// However a clock disturbance begins, a sustained run of normal tick
    /// deltas always clears tilt.
    #[test]
    fn tilt_always_clears_after_a_quiet_period(
        start in 0i64..1_000_000,
        deltas in prop::collection::vec(50i64..TILT_TRIGGER_MS, 700),
    ) {
        let (mut c, _admin) =
            Coordinator::new("f1f2".repeat(10), addr("127.0.0.1", 26379), None);
        // The first synthetic tick is wildly off the wall clock and may
        // trigger tilt; everything after it is in range.
        let mut now = start;
        c.note_tick(now);
        for delta in deltas {
            now += delta;
            c.note_tick(now);
        }
        // 700 deltas of at least 50ms exceed the tilt period many times over.
        prop_assert!(now - start > TILT_PERIOD_MS);
        prop_assert!(!c.tilt);
    }
}
