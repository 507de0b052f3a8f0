// src/watcher/persist.rs

//! Durable watcher state. Epoch promises (votes, config epochs) and the
//! learned topology must survive a restart, otherwise a rebooted watcher
//! could vote twice in one epoch or resurrect a demoted primary. The state
//! file is TOML, written atomically through a temp file rename.
//!
//! The set of monitored primaries always comes from the config file; the
//! state file only overlays learned facts onto primaries the config names.

use super::addr::InstanceAddr;
use super::scheduler::Coordinator;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct StateFile {
    pub run_id: String,
    pub current_epoch: u64,
    #[serde(default)]
    pub masters: Vec<MasterState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MasterState {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub quorum: usize,
    pub down_after_ms: u64,
    pub failover_timeout_ms: u64,
    pub parallel_syncs: usize,
    pub config_epoch: u64,
    pub leader_epoch: u64,
    /// `host:port` keys of known replicas.
    #[serde(default)]
    pub replicas: Vec<String>,
    #[serde(default)]
    pub peers: Vec<PeerState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerState {
    pub run_id: String,
    pub host: String,
    pub port: u16,
}

/// Reads a state file, if one exists.
pub async fn load_state(path: &Path) -> anyhow::Result<Option<StateFile>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state = toml::from_str(&text)?;
    Ok(Some(state))
}

impl Coordinator {
    /// Writes the current durable state, if a state path is configured.
    /// Failures are logged rather than propagated: a broken disk must not
    /// stop monitoring, it only weakens restart guarantees.
    pub async fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = self.snapshot();
        let text = match toml::to_string_pretty(&state) {
            Ok(text) => text,
            Err(e) => {
                warn!("state serialization failed: {e}");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        let result = async {
            tokio::fs::write(&tmp, text.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        match result {
            Ok(()) => debug!("state persisted to {}", path.display()),
            Err(e) => warn!("state persist to {} failed: {e}", path.display()),
        }
    }

    pub fn snapshot(&self) -> StateFile {
        let mut masters: Vec<MasterState> = self
            .registry
            .primaries
            .values()
            .map(|p| {
                let mut replicas: Vec<String> = p.replicas.keys().cloned().collect();
                replicas.sort();
                let mut peers: Vec<PeerState> = p
                    .peers
                    .values()
                    .map(|peer| PeerState {
                        run_id: peer.run_id.clone(),
                        host: peer.addr.host.clone(),
                        port: peer.addr.port,
                    })
                    .collect();
                peers.sort_by(|a, b| a.run_id.cmp(&b.run_id));
                MasterState {
                    name: p.name.clone(),
                    host: p.addr.host.clone(),
                    port: p.addr.port,
                    quorum: p.options.quorum,
                    down_after_ms: p.options.down_after.as_millis() as u64,
                    failover_timeout_ms: p.options.failover_timeout.as_millis() as u64,
                    parallel_syncs: p.options.parallel_syncs,
                    config_epoch: p.config_epoch,
                    leader_epoch: p.leader_epoch,
                    replicas,
                    peers,
                }
            })
            .collect();
        masters.sort_by(|a, b| a.name.cmp(&b.name));
        StateFile {
            run_id: self.run_id.clone(),
            current_epoch: self.current_epoch,
            masters,
        }
    }

    /// Overlays a loaded state file onto the configured registry. State
    /// entries for primaries the config no longer names are dropped.
    pub fn apply_state(&mut self, state: StateFile, now: Instant) {
        if !state.run_id.is_empty() {
            self.run_id = state.run_id;
        }
        self.current_epoch = self.current_epoch.max(state.current_epoch);

        for master in state.masters {
            if !self.registry.primaries.contains_key(&master.name) {
                debug!("state for unconfigured master '{}' dropped", master.name);
                continue;
            }
            let recorded = InstanceAddr {
                ip: master.host.parse().ok(),
                host: master.host,
                port: master.port,
            };
            {
                let primary = self
                    .registry
                    .primaries
                    .get_mut(&master.name)
                    .expect("checked above");
                primary.config_epoch = master.config_epoch;
                primary.leader_epoch = master.leader_epoch;
                // Runtime SET changes persist across restarts and win over
                // the static config, like the recorded address does.
                if master.quorum > 0 {
                    primary.options.quorum = master.quorum;
                }
                if master.down_after_ms > 0 {
                    primary.options.down_after =
                        std::time::Duration::from_millis(master.down_after_ms);
                }
                if master.failover_timeout_ms > 0 {
                    primary.options.failover_timeout =
                        std::time::Duration::from_millis(master.failover_timeout_ms);
                }
                if master.parallel_syncs > 0 {
                    primary.options.parallel_syncs = master.parallel_syncs;
                }
            }
            // The recorded address wins over the configured one: a failover
            // may have moved the primary while we were down.
            let configured = self.registry.primaries[&master.name].addr.clone();
            if configured != recorded {
                let _ = self
                    .registry
                    .switch_primary_addr(&master.name, recorded, now);
            }
            for key in master.replicas {
                if let Ok(addr) = InstanceAddr::parse_lazy(&key) {
                    let _ = self.registry.add_replica(&master.name, addr);
                }
            }
            for peer in master.peers {
                let addr = InstanceAddr {
                    ip: peer.host.parse().ok(),
                    host: peer.host,
                    port: peer.port,
                };
                let _ = self.registry.add_peer(&master.name, &peer.run_id, addr);
            }
        }
    }
}
