// src/watcher/gossip.rs

//! Hello-channel gossip: each watcher periodically publishes who it is and
//! what it believes the topology looks like, on a well-known pub/sub channel
//! of every primary and replica it monitors. Listening on the same channel is
//! how watchers discover each other and how a newer primary configuration
//! spreads without any direct watcher-to-watcher registration.

use super::addr::InstanceAddr;
use super::scheduler::Coordinator;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Announced address of the publishing watcher.
    pub host: String,
    pub port: u16,
    pub run_id: String,
    pub current_epoch: u64,
    pub master_name: String,
    pub master_host: String,
    pub master_port: u16,
    pub master_config_epoch: u64,
}

impl Coordinator {
    /// Builds this watcher's hello payload for one monitored primary.
    pub fn build_hello(&self, name: &str) -> Option<String> {
        let primary = self.registry.primaries.get(name)?;
        let msg = HelloMessage {
            host: self.announce.host.clone(),
            port: self.announce.port,
            run_id: self.run_id.clone(),
            current_epoch: self.current_epoch,
            master_name: name.to_string(),
            master_host: primary.addr.host.clone(),
            master_port: primary.addr.port,
            master_config_epoch: primary.config_epoch,
        };
        serde_json::to_string(&msg).ok()
    }

    /// Ingests a hello seen on any subscribed channel.
    pub async fn process_hello(&mut self, payload: &Bytes, now: Instant) {
        let msg: HelloMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("discarding malformed hello: {e}");
                return;
            }
        };
        if msg.run_id == self.run_id {
            return;
        }
        if !self.registry.primaries.contains_key(&msg.master_name) {
            debug!("hello for unmonitored master '{}' ignored", msg.master_name);
            return;
        }

        if msg.current_epoch > self.current_epoch {
            info!("+new-epoch {} (from hello)", msg.current_epoch);
            self.current_epoch = msg.current_epoch;
            self.persist_state().await;
        }

        self.note_peer(&msg, now).await;
        self.apply_hello_config(&msg, now).await;
    }

    /// Creates or refreshes the peer record the hello describes.
    async fn note_peer(&mut self, msg: &HelloMessage, now: Instant) {
        let peer_addr = InstanceAddr {
            host: msg.host.clone(),
            ip: msg.host.parse().ok(),
            port: msg.port,
        };
        let name = msg.master_name.as_str();
        let known = match self
            .registry
            .primaries
            .get_mut(name)
            .and_then(|p| p.peers.get_mut(&msg.run_id))
        {
            Some(peer) => {
                peer.last_hello = Some(now);
                Some(peer.addr != peer_addr)
            }
            None => None,
        };
        if let Some(addr_changed) = known {
            if addr_changed {
                self.registry.update_peer_addr(&msg.run_id, &peer_addr);
            }
            return;
        }

        // Same address under a new run id: the peer restarted. Drop the old
        // identity before registering the new one.
        let replaced: Vec<String> = self
            .registry
            .primaries
            .get(name)
            .map(|p| {
                p.peers
                    .values()
                    .filter(|peer| peer.addr == peer_addr)
                    .map(|peer| peer.run_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for old_id in replaced {
            info!("-sentinel {old_id} (address reused by {})", msg.run_id);
            self.registry.remove_peer(name, &old_id);
        }

        if self.registry.add_peer(name, &msg.run_id, peer_addr).is_ok() {
            info!("+sentinel {} {}:{} for master {name}", msg.run_id, msg.host, msg.port);
            if let Some(peer) = self
                .registry
                .primaries
                .get_mut(name)
                .and_then(|p| p.peers.get_mut(&msg.run_id))
            {
                peer.last_hello = Some(now);
            }
            self.persist_state().await;
        }
    }

    /// Adopts the hello's primary configuration if it carries a strictly
    /// newer config epoch than ours.
    async fn apply_hello_config(&mut self, msg: &HelloMessage, now: Instant) {
        let name = msg.master_name.as_str();
        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        if msg.master_config_epoch <= primary.config_epoch {
            return;
        }
        let announced = InstanceAddr {
            host: msg.master_host.clone(),
            ip: msg.master_host.parse().ok(),
            port: msg.master_port,
        };
        primary.config_epoch = msg.master_config_epoch;
        if primary.addr != announced {
            info!(
                "+config-update-from {} epoch {}: master {name} -> {announced}",
                msg.run_id, msg.master_config_epoch
            );
            let _ = self.registry.switch_primary_addr(name, announced, now);
        }
        self.persist_state().await;
    }
}
