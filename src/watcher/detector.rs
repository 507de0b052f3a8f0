// src/watcher/detector.rs

//! Failure detection: the subjective verdict (this watcher alone cannot get a
//! timely ack) and the objective one (enough peers agree, per the configured
//! quorum). Subjective down is symmetric and self-clearing; objective down is
//! only ever computed for primaries, because only primaries are failed over.

use super::scheduler::Coordinator;
use super::{ASK_REPLY_VALIDITY, INFO_PERIOD};
use std::time::Instant;
use tracing::{info, warn};

impl Coordinator {
    /// Re-evaluates subjective down for a primary and all of its replicas.
    pub fn update_sdown(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        let down_after = primary.options.down_after;
        let reboot_down_after = primary.options.reboot_down_after;

        let last_ack = self.registry.links.get(primary.link).map(|l| l.last_ack);
        let no_ack = last_ack.is_some_and(|at| now.duration_since(at) > down_after);

        // A node insisting it is a replica while we monitor it as the primary
        // is effectively down for failover purposes, once it has had ample
        // time to recover its role after a restart or a partition heal.
        let wrong_role = primary.role_reported == super::instance::Role::Replica
            && now.duration_since(primary.role_reported_at) > down_after + INFO_PERIOD * 2;

        // A primary whose run id changed rebooted. If it then stays without a
        // single accepted reply past the configured grace, it counts as down
        // even though down_after has not elapsed yet.
        let rebooted = !reboot_down_after.is_zero()
            && primary.reboot_at.is_some_and(|at| {
                now.duration_since(at) > reboot_down_after
                    && last_ack.is_none_or(|ack| ack < at)
            });

        let is_down = no_ack || wrong_role || rebooted;
        let primary = self
            .registry
            .primaries
            .get_mut(name)
            .expect("primary still present");
        match (is_down, primary.sdown_since) {
            (true, None) => {
                warn!("+sdown master {name} {}", primary.addr);
                primary.sdown_since = Some(now);
            }
            (false, Some(_)) => {
                info!("-sdown master {name} {}", primary.addr);
                primary.sdown_since = None;
            }
            _ => {}
        }

        // Replicas only have the ack criterion.
        let replica_links: Vec<(String, super::events::LinkId)> = primary
            .replicas
            .iter()
            .map(|(key, r)| (key.clone(), r.link))
            .collect();
        for (key, link_id) in replica_links {
            let no_ack = self
                .registry
                .links
                .get(link_id)
                .is_some_and(|l| now.duration_since(l.last_ack) > down_after);
            let Some(primary) = self.registry.primaries.get_mut(name) else {
                return;
            };
            let Some(replica) = primary.replicas.get_mut(&key) else {
                continue;
            };
            match (no_ack, replica.sdown_since) {
                (true, None) => {
                    warn!("+sdown slave {key} of {name}");
                    replica.sdown_since = Some(now);
                }
                (false, Some(_)) => {
                    info!("-sdown slave {key} of {name}");
                    replica.sdown_since = None;
                }
                _ => {}
            }
        }
    }

    /// Re-evaluates objective down for a primary: our own subjective verdict
    /// plus fresh agreeing peer reports must reach the quorum. The verdict
    /// clears the instant agreement drops below quorum; there is no odown
    /// hysteresis.
    pub fn update_odown(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        let mut agreeing = 0usize;
        if primary.is_sdown() {
            agreeing = 1; // our own verdict
            agreeing += primary
                .peers
                .values()
                .filter(|p| p.down_report_valid(now, ASK_REPLY_VALIDITY))
                .count();
        }
        let is_down = agreeing >= primary.options.quorum && primary.is_sdown();
        match (is_down, primary.odown_since) {
            (true, None) => {
                warn!(
                    "+odown master {name} {} (quorum {}/{})",
                    primary.addr, agreeing, primary.options.quorum
                );
                primary.odown_since = Some(now);
            }
            (false, Some(_)) => {
                info!("-odown master {name} {}", primary.addr);
                primary.odown_since = None;
            }
            _ => {}
        }
    }
}
