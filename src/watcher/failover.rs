// src/watcher/failover.rs

//! The failover state machine. One primary runs at most one failover at a
//! time; states only move forward, and an abort (allowed until replicas start
//! being rewritten) resets to idle without touching the topology.

use super::events::{CommandCtx, CommandKind, Target};
use super::instance::{FailoverState, ReconfigStage};
use super::scheduler::Coordinator;
use super::{ELECTION_TIMEOUT_MAX, INFO_PERIOD, INFO_VALIDITY, MAX_START_DELAY_MS, RECONF_TIMEOUT};
use crate::core::protocol::RespFrame;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};

impl Coordinator {
    /// Starts a failover attempt if the primary is objectively down (or the
    /// operator forced one), no attempt is running, and the previous attempt
    /// is far enough in the past. Bidding means consuming a fresh epoch and
    /// voting for ourselves in it.
    pub async fn maybe_start_failover(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        if primary.failover_in_progress() {
            return;
        }
        if !primary.is_odown() && !primary.failover_forced {
            return;
        }
        let holdoff = primary.options.failover_timeout * 2;
        if primary
            .last_failover_attempt
            .is_some_and(|at| now.duration_since(at) < holdoff)
        {
            return;
        }

        self.current_epoch += 1;
        let epoch = self.current_epoch;
        let run_id = self.run_id.clone();
        // Small random delay before acting, so watchers that saw the failure
        // at the same instant do not all bid in lockstep.
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_START_DELAY_MS));

        let primary = self
            .registry
            .primaries
            .get_mut(name)
            .expect("primary still present");
        info!("+new-epoch {epoch}");
        info!("+try-failover master {name} {}", primary.addr);
        primary.failover_epoch = epoch;
        primary.leader = Some(run_id);
        primary.leader_epoch = epoch;
        primary.failover_started_at = now;
        primary.failover_start_delay = delay;
        primary.last_failover_attempt = Some(now);
        primary.set_failover_state(FailoverState::WaitStart, now);
        self.persist_state().await;
    }

    /// Drives the machine one step. Called every tick while not tilted.
    pub async fn advance_failover(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        match primary.failover_state {
            FailoverState::None => {}
            FailoverState::WaitStart => self.failover_wait_start(name, now).await,
            FailoverState::SelectReplica => self.failover_select_replica(name, now),
            FailoverState::SendPromote => self.failover_send_promote(name, now),
            FailoverState::WaitPromotion => self.failover_wait_promotion(name, now),
            FailoverState::ReconfigureReplicas => self.failover_reconfigure(name, now),
            FailoverState::UpdateTopology => self.failover_update_topology(name, now).await,
        }
    }

    async fn failover_wait_start(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        if now.duration_since(primary.failover_state_changed_at) < primary.failover_start_delay {
            return;
        }
        if primary.failover_forced {
            info!("+forced-failover master {name}; skipping election");
            let primary = self.registry.primaries.get_mut(name).expect("present");
            primary.set_failover_state(FailoverState::SelectReplica, now);
            return;
        }

        let epoch = primary.failover_epoch;
        let election_timeout =
            std::cmp::min(primary.options.failover_timeout, ELECTION_TIMEOUT_MAX);
        match self.leader_for_epoch(name, epoch) {
            Some(winner) if winner == self.run_id => {
                info!("+elected-leader master {name} epoch {epoch}");
                let primary = self.registry.primaries.get_mut(name).expect("present");
                primary.set_failover_state(FailoverState::SelectReplica, now);
            }
            _ => {
                let primary = self.registry.primaries.get(name).expect("present");
                if now.duration_since(primary.failover_started_at) > election_timeout {
                    warn!("-failover-abort-not-elected master {name} epoch {epoch}");
                    self.abort_failover(name, now);
                }
            }
        }
    }

    fn failover_select_replica(&mut self, name: &str, now: Instant) {
        match self.select_promotion_target(name, now) {
            Some(key) => {
                let primary = self.registry.primaries.get_mut(name).expect("present");
                info!("+selected-slave {key} for master {name}");
                if let Some(replica) = primary.replicas.get_mut(&key) {
                    replica.promoted = true;
                }
                primary.promoted = Some(key);
                primary.set_failover_state(FailoverState::SendPromote, now);
            }
            None => {
                warn!("-failover-abort-no-good-slave master {name}");
                self.abort_failover(name, now);
            }
        }
    }

    fn failover_send_promote(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        let timeout = primary.options.failover_timeout;
        if now.duration_since(primary.failover_state_changed_at) > timeout {
            warn!("-failover-abort-cant-promote master {name}");
            self.abort_failover(name, now);
            return;
        }
        let Some(key) = primary.promoted.clone() else {
            self.abort_failover(name, now);
            return;
        };
        let directive = primary.options.directive("REPLICAOF").to_string();
        let Some(replica) = primary.replicas.get(&key) else {
            self.abort_failover(name, now);
            return;
        };
        let link = replica.link;
        let frame = RespFrame::command([directive, "NO".to_string(), "ONE".to_string()]);
        let ctx = CommandCtx {
            primary: name.to_string(),
            target: Target::Replica(key.clone()),
            kind: CommandKind::Promote,
        };
        if self.send_command(link, frame, ctx) {
            info!("+promote-sent {key} for master {name}");
            let primary = self.registry.primaries.get_mut(name).expect("present");
            primary.set_failover_state(FailoverState::WaitPromotion, now);
        }
        // Not sent (link down or saturated): retried next tick until timeout.
    }

    fn failover_wait_promotion(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        if now.duration_since(primary.failover_state_changed_at) > primary.options.failover_timeout
        {
            warn!("-failover-abort-slave-timeout master {name}");
            self.abort_failover(name, now);
        }
    }

    /// Called from INFO ingestion when the chosen replica reports the primary
    /// role. The promotion is now a fact; record it under the failover epoch
    /// so the new topology wins every configuration comparison.
    pub(super) async fn on_promotion_confirmed(&mut self, name: &str, key: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        if primary.failover_state != FailoverState::WaitPromotion
            || primary.promoted.as_deref() != Some(key)
        {
            return;
        }
        info!("+promoted-slave {key} of master {name}");
        primary.config_epoch = primary.failover_epoch;
        primary.set_failover_state(FailoverState::ReconfigureReplicas, now);
        self.persist_state().await;
    }

    fn failover_reconfigure(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        // Past WaitPromotion an abort is a no-op, so a lost promotion record
        // must clear the machine directly or it would spin here forever.
        let Some(promoted_key) = primary.promoted.clone() else {
            warn!("-failover-abort master {name}: promoted replica record lost");
            primary.clear_failover(now);
            return;
        };
        let Some(new_addr) = primary.replicas.get(&promoted_key).map(|r| r.addr.clone()) else {
            warn!("-failover-abort master {name}: promoted replica record lost");
            primary.clear_failover(now);
            return;
        };

        // A replica stuck past the per-replica timeout is written off so one
        // unreachable replica cannot wedge the failover; INFO refresh steers
        // it onto the new primary later. The failover timeout is the outer
        // valve that force-finishes everything.
        let global_timeout = now.duration_since(primary.failover_state_changed_at)
            > primary.options.failover_timeout;
        for (key, replica) in primary.replicas.iter_mut() {
            if key == &promoted_key {
                continue;
            }
            let stuck = matches!(
                replica.reconfig,
                ReconfigStage::Sent | ReconfigStage::InProgress
            ) && now.duration_since(replica.reconfig_changed_at) > RECONF_TIMEOUT;
            if global_timeout || stuck {
                if replica.reconfig != ReconfigStage::Done {
                    warn!("+slave-reconf-timeout {key} of master {name}");
                }
                replica.set_reconfig(ReconfigStage::Done, now);
            }
        }

        let in_flight = primary
            .replicas
            .iter()
            .filter(|(key, r)| {
                *key != &promoted_key
                    && matches!(r.reconfig, ReconfigStage::Sent | ReconfigStage::InProgress)
            })
            .count();
        let budget = primary.options.parallel_syncs.saturating_sub(in_flight);
        let next: Vec<String> = primary
            .replicas
            .iter()
            .filter(|(key, r)| *key != &promoted_key && r.reconfig == ReconfigStage::None)
            .map(|(key, _)| key.clone())
            .take(budget)
            .collect();
        for key in next {
            self.send_replicaof(name, &key, &new_addr);
            let primary = self.registry.primaries.get_mut(name).expect("present");
            if let Some(replica) = primary.replicas.get_mut(&key) {
                info!("+slave-reconf-sent {key} of master {name}");
                replica.set_reconfig(ReconfigStage::Sent, now);
            }
        }

        let primary = self.registry.primaries.get_mut(name).expect("present");
        let all_done = primary
            .replicas
            .iter()
            .filter(|(key, _)| *key != &promoted_key)
            .all(|(_, r)| r.reconfig == ReconfigStage::Done);
        if all_done {
            primary.set_failover_state(FailoverState::UpdateTopology, now);
        }
    }

    async fn failover_update_topology(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        let Some(promoted_key) = primary.promoted.clone() else {
            warn!("-failover-abort master {name}: promoted replica record lost");
            primary.clear_failover(now);
            return;
        };
        let Some(new_addr) = primary.replicas.get(&promoted_key).map(|r| r.addr.clone()) else {
            warn!("-failover-abort master {name}: promoted replica record lost");
            primary.clear_failover(now);
            return;
        };
        let old_addr = primary.addr.clone();
        info!("+switch-master {name} {old_addr} -> {new_addr}");
        if self
            .registry
            .switch_primary_addr(name, new_addr, now)
            .is_ok()
        {
            self.persist_state().await;
        }
    }

    /// Abandons the running failover, if its state still permits it.
    pub fn abort_failover(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        if !primary.failover_state.can_abort() {
            return;
        }
        info!(
            "-failover-abort master {name} in state {}",
            primary.failover_state.as_str()
        );
        primary.clear_failover(now);
    }

    /// Picks the replica to promote, or `None` when no replica qualifies.
    /// Order of preference: lowest priority, then highest replication offset,
    /// then lexicographically smallest run id.
    pub fn select_promotion_target(&self, name: &str, now: Instant) -> Option<String> {
        let primary = self.registry.primaries.get(name)?;
        let down_after = primary.options.down_after;

        // How stale an INFO we tolerate, and how long a replica may have been
        // cut off from the primary, both scale with how long the failure has
        // been going on.
        let info_validity = if primary.is_sdown() {
            INFO_VALIDITY
        } else {
            INFO_VALIDITY + INFO_PERIOD
        };
        let max_link_down = primary
            .sdown_since
            .map(|since| now.duration_since(since) + down_after * 10);

        let mut candidates: Vec<(&String, u32, u64, Option<&String>)> = primary
            .replicas
            .iter()
            .filter(|(_, r)| !r.is_sdown() && r.priority > 0)
            .filter(|(_, r)| {
                self.registry
                    .links
                    .get(r.link)
                    .is_some_and(|l| l.cmd_ready())
            })
            .filter(|(_, r)| {
                r.info_refresh
                    .is_some_and(|at| now.duration_since(at) <= info_validity)
            })
            .filter(|(_, r)| {
                max_link_down.is_none_or(|max| r.primary_link_up || r.primary_link_down_time <= max)
            })
            .map(|(key, r)| (key, r.priority, r.repl_offset, r.run_id.as_ref()))
            .collect();

        candidates.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then(b.2.cmp(&a.2))
                .then(match (a.3, b.3) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
        });
        candidates.first().map(|(key, ..)| (*key).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::addr::InstanceAddr;
    use crate::watcher::instance::PrimaryOptions;
    use crate::watcher::link::{CmdConn, LINK_QUEUE_DEPTH};
    use tokio::sync::mpsc;

    fn addr(host: &str, port: u16) -> InstanceAddr {
        InstanceAddr {
            host: host.into(),
            ip: host.parse().ok(),
            port,
        }
    }

    fn coordinator() -> Coordinator {
        let (mut c, _admin) =
            Coordinator::new("me00".repeat(10), addr("127.0.0.1", 26379), None);
        c.registry
            .create_primary("cache", addr("10.0.0.1", 6379), PrimaryOptions::default())
            .unwrap();
        c
    }

    fn add_live_replica(
        c: &mut Coordinator,
        host: &str,
        priority: u32,
        offset: u64,
        run_id: &str,
        now: Instant,
    ) -> String {
        let key = c.registry.add_replica("cache", addr(host, 6380)).unwrap();
        let link = c.registry.primaries["cache"].replicas[&key].link;
        let (tx, _rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        // Leak the receiver side out of scope; the connection only needs to
        // look ready for selection purposes.
        std::mem::forget(_rx);
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
        replica.priority = priority;
        replica.repl_offset = offset;
        replica.run_id = Some(run_id.to_string());
        replica.info_refresh = Some(now);
        replica.primary_link_up = true;
        key
    }

    #[test]
    fn selection_prefers_priority_then_offset_then_run_id() {
        let mut c = coordinator();
        let now = Instant::now();
        add_live_replica(&mut c, "10.0.0.2", 1, 100, "aaa", now);
        let expect = add_live_replica(&mut c, "10.0.0.3", 1, 150, "bbb", now);
        add_live_replica(&mut c, "10.0.0.4", 2, 200, "ccc", now);

        assert_eq!(c.select_promotion_target("cache", now), Some(expect));
    }

    #[test]
    fn zero_priority_and_stale_replicas_are_excluded() {
        let mut c = coordinator();
        let now = Instant::now();
        let a = add_live_replica(&mut c, "10.0.0.2", 0, 900, "aaa", now);
        let b = add_live_replica(&mut c, "10.0.0.3", 5, 100, "bbb", now);
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            // Priority zero never gets promoted.
            assert_eq!(primary.replicas[&a].priority, 0);
            // And the other one's INFO goes stale.
            primary.replicas.get_mut(&b).unwrap().info_refresh =
                Some(now - Duration::from_secs(60));
        }
        assert_eq!(c.select_promotion_target("cache", now), None);
    }

    #[tokio::test]
    async fn odown_starts_a_failover_with_a_fresh_epoch() {
        let mut c = coordinator();
        let now = Instant::now();
        c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);

        c.maybe_start_failover("cache", now).await;
        let primary = &c.registry.primaries["cache"];
        assert_eq!(primary.failover_state, FailoverState::WaitStart);
        assert_eq!(primary.failover_epoch, 1);
        assert_eq!(c.current_epoch, 1);
        // We voted for ourselves in the new epoch.
        assert_eq!(primary.leader.as_deref(), Some(c.run_id.as_str()));
        assert_eq!(primary.leader_epoch, 1);

        // Running already: no second attempt, no epoch churn.
        c.maybe_start_failover("cache", now).await;
        assert_eq!(c.current_epoch, 1);
    }

    #[tokio::test]
    async fn failed_attempt_is_rate_limited() {
        let mut c = coordinator();
        let now = Instant::now();
        c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);
        c.maybe_start_failover("cache", now).await;
        c.abort_failover("cache", now);
        assert!(!c.registry.primaries["cache"].failover_in_progress());

        // Still objectively down, but inside the holdoff window.
        c.maybe_start_failover("cache", now + Duration::from_secs(10)).await;
        assert!(!c.registry.primaries["cache"].failover_in_progress());
        assert_eq!(c.current_epoch, 1);
    }

    #[tokio::test]
    async fn forced_failover_skips_the_election() {
        let mut c = coordinator();
        let now = Instant::now();
        let key = add_live_replica(&mut c, "10.0.0.2", 1, 100, "aaa", now);
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.failover_forced = true;
        }
        c.maybe_start_failover("cache", now).await;
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.failover_start_delay = Duration::ZERO;
        }
        c.advance_failover("cache", now + Duration::from_millis(1)).await;
        assert_eq!(
            c.registry.primaries["cache"].failover_state,
            FailoverState::SelectReplica
        );
        c.advance_failover("cache", now + Duration::from_millis(2)).await;
        let primary = &c.registry.primaries["cache"];
        assert_eq!(primary.failover_state, FailoverState::SendPromote);
        assert_eq!(primary.promoted.as_deref(), Some(key.as_str()));
        assert!(primary.replicas[&key].promoted);
    }

    #[tokio::test]
    async fn unelected_bid_aborts_after_the_election_timeout() {
        let mut c = coordinator();
        let now = Instant::now();
        // Two peers exist, so one vote of three is no majority.
        c.registry.add_peer("cache", "p1", addr("10.0.5.1", 26379)).unwrap();
        c.registry.add_peer("cache", "p2", addr("10.0.5.2", 26379)).unwrap();
        c.registry.primaries.get_mut("cache").unwrap().odown_since = Some(now);
        c.maybe_start_failover("cache", now).await;
        c.registry
            .primaries
            .get_mut("cache")
            .unwrap()
            .failover_start_delay = Duration::ZERO;

        c.advance_failover("cache", now + Duration::from_secs(1)).await;
        assert_eq!(
            c.registry.primaries["cache"].failover_state,
            FailoverState::WaitStart
        );
        c.advance_failover("cache", now + ELECTION_TIMEOUT_MAX + Duration::from_secs(1))
            .await;
        assert_eq!(
            c.registry.primaries["cache"].failover_state,
            FailoverState::None
        );
    }

    #[tokio::test]
    async fn promotion_confirmation_records_the_config_epoch() {
        let mut c = coordinator();
        let now = Instant::now();
        let key = add_live_replica(&mut c, "10.0.0.2", 1, 100, "aaa", now);
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.failover_epoch = 7;
            primary.promoted = Some(key.clone());
            primary.replicas.get_mut(&key).unwrap().promoted = true;
            primary.set_failover_state(FailoverState::WaitStart, now);
            primary.set_failover_state(FailoverState::SelectReplica, now);
            primary.set_failover_state(FailoverState::SendPromote, now);
            primary.set_failover_state(FailoverState::WaitPromotion, now);
        }
        c.on_promotion_confirmed("cache", &key, now).await;
        let primary = &c.registry.primaries["cache"];
        assert_eq!(primary.config_epoch, 7);
        assert_eq!(primary.failover_state, FailoverState::ReconfigureReplicas);
    }

    #[tokio::test]
    async fn topology_update_switches_the_primary_address() {
        let mut c = coordinator();
        let now = Instant::now();
        let key = add_live_replica(&mut c, "10.0.0.2", 1, 100, "aaa", now);
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.promoted = Some(key);
            primary.set_failover_state(FailoverState::WaitStart, now);
            primary.set_failover_state(FailoverState::SelectReplica, now);
            primary.set_failover_state(FailoverState::SendPromote, now);
            primary.set_failover_state(FailoverState::WaitPromotion, now);
            primary.set_failover_state(FailoverState::ReconfigureReplicas, now);
            primary.set_failover_state(FailoverState::UpdateTopology, now);
        }
        c.advance_failover("cache", now).await;
        let primary = &c.registry.primaries["cache"];
        assert_eq!(primary.addr, addr("10.0.0.2", 6380));
        assert_eq!(primary.failover_state, FailoverState::None);
        // The old primary address is now tracked as a replica.
        assert!(primary.replicas.contains_key("10.0.0.1:6379"));
    }

    #[tokio::test]
    async fn lost_promotion_record_clears_a_late_failover() {
        let mut c = coordinator();
        let now = Instant::now();
        add_live_replica(&mut c, "10.0.0.2", 1, 100, "aaa", now);

        // A failover past the point of no abort, with no promoted record.
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.set_failover_state(FailoverState::WaitStart, now);
            primary.set_failover_state(FailoverState::SelectReplica, now);
            primary.set_failover_state(FailoverState::SendPromote, now);
            primary.set_failover_state(FailoverState::WaitPromotion, now);
            primary.set_failover_state(FailoverState::ReconfigureReplicas, now);
        }
        c.advance_failover("cache", now).await;
        assert_eq!(
            c.registry.primaries["cache"].failover_state,
            FailoverState::None
        );

        // Same in the final state.
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.set_failover_state(FailoverState::WaitStart, now);
            primary.set_failover_state(FailoverState::SelectReplica, now);
            primary.set_failover_state(FailoverState::SendPromote, now);
            primary.set_failover_state(FailoverState::WaitPromotion, now);
            primary.set_failover_state(FailoverState::ReconfigureReplicas, now);
            primary.set_failover_state(FailoverState::UpdateTopology, now);
        }
        c.advance_failover("cache", now).await;
        assert_eq!(
            c.registry.primaries["cache"].failover_state,
            FailoverState::None
        );
    }
}
