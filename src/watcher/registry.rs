// src/watcher/registry.rs

//! The instance registry: every monitored primary, its replicas and peer
//! watchers, plus the link set they all draw connections from. The registry
//! is a plain owned value inside the coordinator — no interior mutability,
//! no globals — so several registries can coexist in one test process.

use super::addr::InstanceAddr;
use super::events::LinkId;
use super::instance::{PeerWatcher, PrimaryInstance, PrimaryOptions, ReplicaInstance, Role};
use super::link::LinkSet;
use crate::core::VigilError;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct Registry {
    pub primaries: HashMap<String, PrimaryInstance>,
    pub links: LinkSet,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new monitored primary. Fails without mutating anything if
    /// the name is taken.
    pub fn create_primary(
        &mut self,
        name: &str,
        addr: InstanceAddr,
        options: PrimaryOptions,
    ) -> Result<(), VigilError> {
        if self.primaries.contains_key(name) {
            return Err(VigilError::DuplicateName(name.to_string()));
        }
        let link = self.links.alloc(addr.clone());
        self.primaries.insert(
            name.to_string(),
            PrimaryInstance::new(name.to_string(), addr, link, options),
        );
        Ok(())
    }

    /// Removes a primary and releases every link it holds a reference to.
    pub fn remove_primary(&mut self, name: &str) -> Result<(), VigilError> {
        let primary = self
            .primaries
            .remove(name)
            .ok_or(VigilError::NoSuchPrimary)?;
        self.links.release(primary.link);
        for replica in primary.replicas.values() {
            self.links.release(replica.link);
        }
        for peer in primary.peers.values() {
            self.links.release(peer.link);
        }
        Ok(())
    }

    /// Adds a replica under a primary, keyed by address.
    pub fn add_replica(
        &mut self,
        primary_name: &str,
        addr: InstanceAddr,
    ) -> Result<String, VigilError> {
        let Registry { primaries, links } = self;
        let primary = primaries
            .get_mut(primary_name)
            .ok_or(VigilError::NoSuchPrimary)?;
        let key = addr.key();
        if primary.replicas.contains_key(&key) || addr == primary.addr {
            return Err(VigilError::DuplicateAddress(key));
        }
        let link = links.alloc(addr.clone());
        primary
            .replicas
            .insert(key.clone(), ReplicaInstance::new(addr, link));
        Ok(key)
    }

    /// Adds a peer watcher under a primary, keyed by its run id. If the same
    /// identity is already known under another primary, the two records share
    /// one link so probes to a physical peer happen once, not once per
    /// monitored primary.
    pub fn add_peer(
        &mut self,
        primary_name: &str,
        run_id: &str,
        addr: InstanceAddr,
    ) -> Result<(), VigilError> {
        if !self.primaries.contains_key(primary_name) {
            return Err(VigilError::NoSuchPrimary);
        }
        if self
            .primaries
            .get(primary_name)
            .is_some_and(|p| p.peers.contains_key(run_id))
        {
            return Err(VigilError::DuplicateIdentity(run_id.to_string()));
        }

        let shared = self.shared_peer_link(run_id, primary_name);
        let Registry { primaries, links } = self;
        let link = match shared {
            Some(id) => {
                links.acquire(id);
                debug!("watcher {run_id} link shared across masters (refcount {})", links.refcount(id));
                id
            }
            None => links.alloc(addr.clone()),
        };
        let primary = primaries
            .get_mut(primary_name)
            .expect("primary existence checked above");
        primary
            .peers
            .insert(run_id.to_string(), PeerWatcher::new(run_id.to_string(), addr, link));
        Ok(())
    }

    /// Finds the link of a peer with the same identity under another primary.
    fn shared_peer_link(&self, run_id: &str, exclude_primary: &str) -> Option<LinkId> {
        self.primaries
            .iter()
            .filter(|(name, _)| name.as_str() != exclude_primary)
            .find_map(|(_, p)| p.peers.get(run_id).map(|peer| peer.link))
    }

    pub fn remove_peer(&mut self, primary_name: &str, run_id: &str) {
        let Registry { primaries, links } = self;
        if let Some(primary) = primaries.get_mut(primary_name)
            && let Some(peer) = primary.peers.remove(run_id)
        {
            links.release(peer.link);
        }
    }

    /// A peer announced a new address for a known identity: update the record
    /// under every primary and force the shared link to reconnect.
    pub fn update_peer_addr(&mut self, run_id: &str, new_addr: &InstanceAddr) {
        let Registry { primaries, links } = self;
        let mut touched: Vec<LinkId> = Vec::new();
        for primary in primaries.values_mut() {
            if let Some(peer) = primary.peers.get_mut(run_id) {
                peer.addr = new_addr.clone();
                if !touched.contains(&peer.link) {
                    touched.push(peer.link);
                }
            }
        }
        for id in touched {
            if let Some(link) = links.get_mut(id) {
                info!(
                    "watcher {run_id} moved from {} to {new_addr}; recycling link",
                    link.addr
                );
                link.addr = new_addr.clone();
                link.drop_cmd_conn();
                link.drop_pubsub_conn();
            }
        }
    }

    /// Looks a primary up by its current address — the path the voting RPC
    /// takes, since peers identify topologies by address, not by name.
    pub fn primary_name_by_addr(&self, addr: &InstanceAddr) -> Option<String> {
        self.primaries
            .values()
            .find(|p| p.addr == *addr)
            .map(|p| p.name.clone())
    }

    /// Forgets everything learned about a primary (replicas, peers, failover
    /// progress) while keeping its configuration and epochs.
    pub fn reset_primary(&mut self, name: &str, now: Instant) -> Result<(), VigilError> {
        let Registry { primaries, links } = self;
        let primary = primaries.get_mut(name).ok_or(VigilError::NoSuchPrimary)?;
        for replica in primary.replicas.values() {
            links.release(replica.link);
        }
        primary.replicas.clear();
        for peer in primary.peers.values() {
            links.release(peer.link);
        }
        primary.peers.clear();
        primary.clear_failover(now);
        primary.leader = None;
        primary.run_id = None;
        primary.info_refresh = None;
        primary.role_reported = Role::Unknown;
        primary.role_reported_at = now;
        primary.sdown_since = None;
        primary.odown_since = None;
        primary.reboot_at = None;
        // Fresh link; the old one may be wedged on a dead endpoint.
        links.release(primary.link);
        primary.link = links.alloc(primary.addr.clone());
        Ok(())
    }

    /// Relabels which address is "primary": the promoted replica leaves the
    /// replica set, the old primary address joins it, and every node gets a
    /// fresh link. The replica set itself is preserved.
    pub fn switch_primary_addr(
        &mut self,
        name: &str,
        new_addr: InstanceAddr,
        now: Instant,
    ) -> Result<(), VigilError> {
        let Registry { primaries, links } = self;
        let primary = primaries.get_mut(name).ok_or(VigilError::NoSuchPrimary)?;

        let old_addr = primary.addr.clone();
        let mut keep: Vec<InstanceAddr> = primary
            .replicas
            .values()
            .map(|r| r.addr.clone())
            .filter(|a| *a != new_addr)
            .collect();
        if old_addr != new_addr && !keep.contains(&old_addr) {
            keep.push(old_addr);
        }

        for replica in primary.replicas.values() {
            links.release(replica.link);
        }
        primary.replicas.clear();
        links.release(primary.link);

        primary.addr = new_addr.clone();
        primary.link = links.alloc(new_addr);
        primary.run_id = None;
        primary.info_refresh = None;
        primary.role_reported = Role::Unknown;
        primary.role_reported_at = now;
        primary.sdown_since = None;
        primary.odown_since = None;
        primary.reboot_at = None;
        primary.clear_failover(now);

        for addr in keep {
            let link = links.alloc(addr.clone());
            primary
                .replicas
                .insert(addr.key(), ReplicaInstance::new(addr, link));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, port: u16) -> InstanceAddr {
        InstanceAddr {
            host: s.into(),
            ip: s.parse().ok(),
            port,
        }
    }

    fn registry_with_two_primaries() -> Registry {
        let mut reg = Registry::new();
        reg.create_primary("cache", addr("10.0.0.1", 6379), PrimaryOptions::default())
            .unwrap();
        reg.create_primary("queue", addr("10.0.1.1", 6379), PrimaryOptions::default())
            .unwrap();
        reg
    }

    #[test]
    fn duplicate_names_and_addresses_are_rejected() {
        let mut reg = registry_with_two_primaries();
        assert!(matches!(
            reg.create_primary("cache", addr("10.9.9.9", 6379), PrimaryOptions::default()),
            Err(VigilError::DuplicateName(_))
        ));
        reg.add_replica("cache", addr("10.0.0.2", 6380)).unwrap();
        assert!(matches!(
            reg.add_replica("cache", addr("10.0.0.2", 6380)),
            Err(VigilError::DuplicateAddress(_))
        ));
        // The primary's own address is not a valid replica address.
        assert!(matches!(
            reg.add_replica("cache", addr("10.0.0.1", 6379)),
            Err(VigilError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn same_identity_under_two_primaries_shares_one_link() {
        let mut reg = registry_with_two_primaries();
        let peer_addr = addr("10.0.5.5", 26379);
        reg.add_peer("cache", "runid-aaaa", peer_addr.clone()).unwrap();
        reg.add_peer("queue", "runid-aaaa", peer_addr).unwrap();

        let cache_link = reg.primaries["cache"].peers["runid-aaaa"].link;
        let queue_link = reg.primaries["queue"].peers["runid-aaaa"].link;
        assert_eq!(cache_link, queue_link);
        assert_eq!(reg.links.refcount(cache_link), 2);

        reg.remove_peer("queue", "runid-aaaa");
        assert_eq!(reg.links.refcount(cache_link), 1);
        assert!(reg.links.get(cache_link).is_some());
    }

    #[test]
    fn duplicate_identity_under_one_primary_is_rejected() {
        let mut reg = registry_with_two_primaries();
        reg.add_peer("cache", "runid-aaaa", addr("10.0.5.5", 26379))
            .unwrap();
        assert!(matches!(
            reg.add_peer("cache", "runid-aaaa", addr("10.0.5.6", 26379)),
            Err(VigilError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn switch_primary_addr_preserves_replica_set() {
        let mut reg = registry_with_two_primaries();
        reg.add_replica("cache", addr("10.0.0.2", 6380)).unwrap();
        reg.add_replica("cache", addr("10.0.0.3", 6381)).unwrap();

        // Promote 10.0.0.2: it leaves the replica set, the old primary joins.
        reg.switch_primary_addr("cache", addr("10.0.0.2", 6380), Instant::now())
            .unwrap();
        let primary = &reg.primaries["cache"];
        assert_eq!(primary.addr, addr("10.0.0.2", 6380));
        let mut keys: Vec<_> = primary.replicas.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["10.0.0.1:6379", "10.0.0.3:6381"]);
    }

    #[test]
    fn peer_addr_change_propagates_to_all_primaries() {
        let mut reg = registry_with_two_primaries();
        reg.add_peer("cache", "runid-aaaa", addr("10.0.5.5", 26379))
            .unwrap();
        reg.add_peer("queue", "runid-aaaa", addr("10.0.5.5", 26379))
            .unwrap();

        let new_addr = addr("10.0.5.9", 26379);
        reg.update_peer_addr("runid-aaaa", &new_addr);
        assert_eq!(reg.primaries["cache"].peers["runid-aaaa"].addr, new_addr);
        assert_eq!(reg.primaries["queue"].peers["runid-aaaa"].addr, new_addr);
        let link = reg.primaries["cache"].peers["runid-aaaa"].link;
        assert_eq!(reg.links.get(link).unwrap().addr, new_addr);
    }
}
