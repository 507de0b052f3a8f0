//! Scenario tests for the down-agreement quorum and the epoch election,
//! driven through the same entry points the coordinator loop uses.

use std::time::{Duration, Instant};
use vigil::core::protocol::RespFrame;
use vigil::watcher::addr::InstanceAddr;
use vigil::watcher::instance::{FailoverState, PrimaryOptions};
use vigil::watcher::scheduler::Coordinator;

fn addr(host: &str, port: u16) -> InstanceAddr {
    InstanceAddr {
        host: host.into(),
        ip: host.parse().ok(),
        port,
    }
}

fn ask_reply(down: bool, leader: &str, epoch: u64) -> RespFrame {
    RespFrame::Array(vec![
        RespFrame::Integer(i64::from(down)),
        RespFrame::BulkString(bytes::Bytes::copy_from_slice(leader.as_bytes())),
        RespFrame::Integer(epoch as i64),
    ])
}

/// Builds a watcher monitoring one primary with `peer_count` known peers.
fn watcher(quorum: usize, peer_count: usize) -> Coordinator {
    let (mut c, _admin) = Coordinator::new("me01".repeat(10), addr("127.0.0.1", 26379), None);
    let options = PrimaryOptions {
        quorum,
        down_after: Duration::from_secs(5),
        ..PrimaryOptions::default()
    };
    c.registry
        .create_primary("cache", addr("10.0.0.1", 6379), options)
        .unwrap();
    for i in 0..peer_count {
        c.registry
            .add_peer(
                "cache",
                &format!("peer-{i}"),
                addr("10.0.5.1", 26379 + i as u16),
            )
            .unwrap();
    }
    c
}

#[tokio::test]
async fn odown_requires_quorum_agreement() {
    let mut c = watcher(3, 4);
    let now = Instant::now();
    c.registry.primaries.get_mut("cache").unwrap().sdown_since = Some(now);

    // One peer agreeing is two of three: not enough.
    c.handle_ask_reply("cache", "peer-0", ask_reply(true, "*", 0), now);
    c.update_odown("cache", now);
    assert!(!c.registry.primaries["cache"].is_odown());

    // A second agreeing peer reaches the quorum of three.
    c.handle_ask_reply("cache", "peer-1", ask_reply(true, "*", 0), now);
    c.update_odown("cache", now);
    assert!(c.registry.primaries["cache"].is_odown());

    // One peer retracting drops agreement below quorum; odown clears at once.
    c.handle_ask_reply("cache", "peer-1", ask_reply(false, "*", 0), now);
    c.update_odown("cache", now);
    assert!(!c.registry.primaries["cache"].is_odown());
}

#[tokio::test]
async fn five_watchers_quorum_four_three_votes_elect_nobody() {
    // Five voters total: four peers plus ourselves, quorum four.
    let mut c = watcher(4, 4);
    let now = Instant::now();
    let me = c.run_id.clone();
    c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);

    c.maybe_start_failover("cache", now).await;
    let epoch = c.registry.primaries["cache"].failover_epoch;
    assert_eq!(epoch, 1);

    // Two peers disclose votes for us: three votes total of five voters.
    // That is a majority, but the quorum of four binds harder.
    c.handle_ask_reply("cache", "peer-0", ask_reply(true, &me, epoch), now);
    c.handle_ask_reply("cache", "peer-1", ask_reply(true, &me, epoch), now);
    assert_eq!(c.leader_for_epoch("cache", epoch), None);

    // The fourth vote settles it.
    c.handle_ask_reply("cache", "peer-2", ask_reply(true, &me, epoch), now);
    assert_eq!(c.leader_for_epoch("cache", epoch), Some(me));
}

#[tokio::test]
async fn elected_watcher_proceeds_to_replica_selection() {
    let mut c = watcher(2, 2);
    let now = Instant::now();
    let me = c.run_id.clone();
    c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);
    c.maybe_start_failover("cache", now).await;
    c.registry
        .primaries
        .get_mut("cache")
        .unwrap()
        .failover_start_delay = Duration::ZERO;
    let epoch = c.registry.primaries["cache"].failover_epoch;

    c.handle_ask_reply("cache", "peer-0", ask_reply(true, &me, epoch), now);
    c.advance_failover("cache", now + Duration::from_millis(1)).await;
    assert_eq!(
        c.registry.primaries["cache"].failover_state,
        FailoverState::SelectReplica
    );
}

#[tokio::test]
async fn tilt_suspends_acting_but_not_answering() {
    let mut c = watcher(1, 0);
    let now = Instant::now();
    c.note_tick(1_000_000);
    c.note_tick(999_000); // clock went backwards
    assert!(c.tilt);

    // While tilted, a vote request is answered but no vote is granted.
    let args: Vec<RespFrame> = ["SENTINEL", "is-master-down-by-addr", "10.0.0.1", "6379", "4", "somebody"]
        .iter()
        .map(|s| RespFrame::BulkString(bytes::Bytes::copy_from_slice(s.as_bytes())))
        .collect();
    let reply = c.handle_admin(&args).await;
    let vigil::core::RespValue::Array(parts) = reply else {
        panic!("expected array reply");
    };
    assert_eq!(parts[1], vigil::core::RespValue::text("*"));
    assert_eq!(c.registry.primaries["cache"].leader, None);

    // And a down primary does not trigger a failover bid.
    c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);
    c.tick().await;
    assert!(!c.registry.primaries["cache"].failover_in_progress());
}
