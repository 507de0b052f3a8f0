// src/watcher/refresh.rs

//! Ingestion of `INFO replication` replies. This is where the watcher learns
//! topology: replicas are discovered from the primary's listing, reboots are
//! noticed through run id changes, promotions are confirmed through role
//! changes, and replicas pointing at the wrong primary are steered back.

use super::events::{CommandCtx, CommandKind, Target};
use super::instance::{InfoReport, ReconfigStage, Role, parse_info};
use super::scheduler::Coordinator;
use crate::core::protocol::RespFrame;
use crate::watcher::addr::InstanceAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

impl Coordinator {
    pub async fn apply_info(&mut self, name: &str, target: &Target, text: &str, now: Instant) {
        let report = parse_info(text);
        match target {
            Target::Primary => self.apply_primary_info(name, report, now).await,
            Target::Replica(key) => self.apply_replica_info(name, key, report, now).await,
            Target::Peer(_) => {}
        }
    }

    async fn apply_primary_info(&mut self, name: &str, report: InfoReport, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        primary.info_refresh = Some(now);

        if let Some(run_id) = &report.run_id {
            match &primary.run_id {
                None => primary.run_id = Some(run_id.clone()),
                Some(known) if known != run_id => {
                    warn!("+reboot master {name} {} (run id changed)", primary.addr);
                    primary.run_id = Some(run_id.clone());
                    primary.reboot_at = Some(now);
                }
                _ => {}
            }
        }

        if let Some(role) = report.role {
            Self::note_role(
                &mut primary.role_reported,
                &mut primary.role_reported_at,
                role,
                now,
            );
        }

        // Discover replicas from the primary's listing. Absence never removes
        // a known replica; only an operator reset does.
        let known_addr = primary.addr.clone();
        let discovered: Vec<InstanceAddr> = report
            .replicas
            .iter()
            .map(|(host, port, _)| InstanceAddr {
                host: host.clone(),
                ip: host.parse().ok(),
                port: *port,
            })
            .filter(|a| *a != known_addr)
            .collect();
        for addr in discovered {
            let key = addr.key();
            if !self.registry.primaries[name].replicas.contains_key(&key)
                && self.registry.add_replica(name, addr).is_ok()
            {
                info!("+slave {key} discovered for master {name}");
            }
        }
    }

    async fn apply_replica_info(&mut self, name: &str, key: &str, report: InfoReport, now: Instant) {
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        let primary_addr = primary.addr.clone();
        let promoted_key = primary.promoted.clone();
        let failover_active = primary.failover_in_progress();
        let primary_healthy = !primary.is_sdown();
        let Some(replica) = primary.replicas.get_mut(key) else {
            return;
        };

        replica.info_refresh = Some(now);
        if let Some(run_id) = report.run_id {
            replica.run_id = Some(run_id);
        }
        if let Some(host) = report.primary_host {
            replica.reported_primary_host = Some(host);
        }
        if let Some(port) = report.primary_port {
            replica.reported_primary_port = port;
        }
        if let Some(up) = report.primary_link_up {
            replica.primary_link_up = up;
        }
        if let Some(t) = report.primary_link_down_time {
            replica.primary_link_down_time = t;
        }
        if let Some(offset) = report.repl_offset {
            replica.repl_offset = offset;
        }
        if let Some(priority) = report.priority {
            replica.priority = priority;
        }
        if let Some(role) = report.role {
            Self::note_role(
                &mut replica.role_reported,
                &mut replica.role_reported_at,
                role,
                now,
            );
        }

        match report.role {
            Some(Role::Primary) => {
                if replica.promoted {
                    // The chosen replica answered to its promotion.
                    self.on_promotion_confirmed(name, key, now).await;
                } else if primary_healthy && !failover_active {
                    // A stray self-declared primary inside a healthy topology
                    // gets demoted back under the monitored primary.
                    debug!("demoting stray master {key} back under {name}");
                    self.send_replicaof(name, key, &primary_addr);
                }
            }
            Some(Role::Replica) => {
                self.track_reconfig(name, key, promoted_key.as_deref(), now);
                self.steer_wrong_primary(name, key, &primary_addr, primary_healthy, failover_active);
            }
            _ => {}
        }
    }

    /// Advances the per-replica reconfiguration stage from what the replica
    /// itself reports: `Sent` becomes `InProgress` once it names the new
    /// primary, `InProgress` becomes `Done` once its replication link is up.
    fn track_reconfig(&mut self, name: &str, key: &str, promoted_key: Option<&str>, now: Instant) {
        let Some(promoted_key) = promoted_key else {
            return;
        };
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        let Some(promoted_addr) = primary.replicas.get(promoted_key).map(|r| r.addr.clone())
        else {
            return;
        };
        let Some(replica) = primary.replicas.get_mut(key) else {
            return;
        };
        let names_new_primary = replica
            .reported_primary_host
            .as_deref()
            .is_some_and(|host| {
                let reported = InstanceAddr {
                    host: host.to_string(),
                    ip: host.parse().ok(),
                    port: replica.reported_primary_port,
                };
                reported == promoted_addr
            });
        match replica.reconfig {
            ReconfigStage::Sent if names_new_primary => {
                replica.set_reconfig(ReconfigStage::InProgress, now);
            }
            ReconfigStage::InProgress if names_new_primary && replica.primary_link_up => {
                info!("+slave-reconf-done {key} of master {name}");
                replica.set_reconfig(ReconfigStage::Done, now);
            }
            _ => {}
        }
    }

    /// Outside a failover, a replica reporting a primary other than the
    /// monitored one is steered back.
    fn steer_wrong_primary(
        &mut self,
        name: &str,
        key: &str,
        primary_addr: &InstanceAddr,
        primary_healthy: bool,
        failover_active: bool,
    ) {
        if failover_active || !primary_healthy {
            return;
        }
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        let Some(replica) = primary.replicas.get(key) else {
            return;
        };
        let Some(host) = replica.reported_primary_host.clone() else {
            return;
        };
        let reported = InstanceAddr {
            ip: host.parse().ok(),
            host,
            port: replica.reported_primary_port,
        };
        if reported != *primary_addr {
            debug!(
                "slave {key} of {name} replicates from {reported}; steering back to {primary_addr}"
            );
            self.send_replicaof(name, key, primary_addr);
        }
    }

    /// Sends `REPLICAOF <host> <port>` (through the renaming table) to a
    /// replica of the named primary.
    pub(super) fn send_replicaof(&mut self, name: &str, key: &str, target_addr: &InstanceAddr) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        let directive = primary.options.directive("REPLICAOF").to_string();
        let Some(replica) = primary.replicas.get(key) else {
            return;
        };
        let link = replica.link;
        let frame = RespFrame::command([
            directive,
            target_addr.host.clone(),
            target_addr.port.to_string(),
        ]);
        let ctx = CommandCtx {
            primary: name.to_string(),
            target: Target::Replica(key.to_string()),
            kind: CommandKind::Reconfigure,
        };
        self.send_command(link, frame, ctx);
    }
}
