// src/watcher/election.rs

//! Epoch-based leader election. Every failover attempt happens in a fresh
//! epoch; each watcher casts at most one vote per epoch, and the failover
//! only proceeds on the watcher that collected both the configured quorum and
//! an absolute majority of known voters for that epoch.

use super::events::{CommandCtx, CommandKind, Target};
use super::scheduler::Coordinator;
use super::ASK_PERIOD;
use crate::core::protocol::RespFrame;
use std::time::Instant;
use tracing::{debug, info};

impl Coordinator {
    /// Sends the is-down RPC to every peer of a primary in subjective down,
    /// one per peer per ask period. While this watcher is running a failover
    /// the RPC doubles as its vote request by carrying our run id instead of
    /// the `*` sentinel value.
    pub fn ask_peers(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };
        if !primary.is_sdown() && !primary.failover_in_progress() {
            return;
        }
        let candidate = if primary.failover_in_progress() {
            self.run_id.clone()
        } else {
            "*".to_string()
        };
        let host = primary.addr.host.clone();
        let port = primary.addr.port.to_string();
        let epoch = self.current_epoch.to_string();

        let due: Vec<(String, super::events::LinkId)> = primary
            .peers
            .values()
            .filter(|p| {
                p.last_ask
                    .is_none_or(|at| now.duration_since(at) >= ASK_PERIOD)
            })
            .map(|p| (p.run_id.clone(), p.link))
            .collect();

        for (peer_id, link) in due {
            let frame = RespFrame::command([
                "SENTINEL".to_string(),
                "IS-MASTER-DOWN-BY-ADDR".to_string(),
                host.clone(),
                port.clone(),
                epoch.clone(),
                candidate.clone(),
            ]);
            let ctx = CommandCtx {
                primary: name.to_string(),
                target: Target::Peer(peer_id.clone()),
                kind: CommandKind::AskDown,
            };
            if self.send_command(link, frame, ctx)
                && let Some(primary) = self.registry.primaries.get_mut(name)
                && let Some(peer) = primary.peers.get_mut(&peer_id)
            {
                peer.last_ask = Some(now);
            }
        }
    }

    /// Ingests a peer's reply to the is-down RPC: `[<down>, <leader|*>,
    /// <leader epoch>]`.
    pub fn handle_ask_reply(&mut self, name: &str, peer_id: &str, frame: RespFrame, now: Instant) {
        let RespFrame::Array(parts) = frame else {
            return;
        };
        let down = matches!(parts.first(), Some(RespFrame::Integer(1)));
        let leader = match parts.get(1) {
            Some(RespFrame::BulkString(b)) => String::from_utf8_lossy(b).into_owned(),
            _ => return,
        };
        let leader_epoch = match parts.get(2) {
            Some(RespFrame::Integer(n)) if *n >= 0 => *n as u64,
            _ => return,
        };

        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return;
        };
        let Some(peer) = primary.peers.get_mut(peer_id) else {
            return;
        };
        peer.down_reported = down;
        peer.down_reply_at = Some(now);
        if leader != "*" {
            debug!("peer {peer_id} voted {leader} in epoch {leader_epoch} for {name}");
            peer.voted_leader = Some(leader);
            peer.voted_leader_epoch = leader_epoch;
        }
    }

    /// Casts (or discloses) this watcher's vote for `req_epoch`. At most one
    /// vote is ever granted per epoch; repeat requests get the recorded vote
    /// back. Returns the vote and its epoch for the RPC reply.
    pub async fn vote_for_leader(
        &mut self,
        name: &str,
        req_epoch: u64,
        candidate: &str,
    ) -> (String, u64) {
        if req_epoch > self.current_epoch {
            self.current_epoch = req_epoch;
            self.persist_state().await;
        }

        let Some(primary) = self.registry.primaries.get_mut(name) else {
            return ("*".to_string(), 0);
        };
        if primary.leader_epoch < req_epoch && self.current_epoch >= req_epoch {
            info!("+vote-granted {candidate} epoch {req_epoch} for master {name}");
            primary.leader = Some(candidate.to_string());
            primary.leader_epoch = req_epoch;
            // Having voted, hold back our own bid for this failure.
            if candidate != self.run_id {
                primary.last_failover_attempt = Some(Instant::now());
            }
            self.persist_state().await;
        }
        let primary = &self.registry.primaries[name];
        (
            primary.leader.clone().unwrap_or_else(|| "*".to_string()),
            primary.leader_epoch,
        )
    }

    /// Tallies votes for `epoch` across our own recorded vote and everything
    /// peers disclosed. The winner must reach both the configured quorum and
    /// a strict majority of known voters (peers plus ourselves); otherwise
    /// there is no leader for this epoch.
    pub fn leader_for_epoch(&self, name: &str, epoch: u64) -> Option<String> {
        let primary = self.registry.primaries.get(name)?;
        let mut tally: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        if primary.leader_epoch == epoch
            && let Some(vote) = &primary.leader
        {
            *tally.entry(vote.as_str()).or_default() += 1;
        }
        for peer in primary.peers.values() {
            if peer.voted_leader_epoch == epoch
                && let Some(vote) = &peer.voted_leader
            {
                *tally.entry(vote.as_str()).or_default() += 1;
            }
        }
        let voters = primary.peers.len() + 1;
        let needed = std::cmp::max(primary.options.quorum, voters / 2 + 1);
        tally
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .filter(|(_, count)| *count >= needed)
            .map(|(winner, _)| winner.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::addr::InstanceAddr;
    use crate::watcher::instance::PrimaryOptions;

    fn addr(host: &str, port: u16) -> InstanceAddr {
        InstanceAddr {
            host: host.into(),
            ip: host.parse().ok(),
            port,
        }
    }

    fn coordinator(quorum: usize, peer_count: usize) -> Coordinator {
        let (mut c, _admin) =
            Coordinator::new("me00".repeat(10), addr("127.0.0.1", 26379), None);
        let options = PrimaryOptions {
            quorum,
            ..PrimaryOptions::default()
        };
        c.registry
            .create_primary("cache", addr("10.0.0.1", 6379), options)
            .unwrap();
        for i in 0..peer_count {
            c.registry
                .add_peer("cache", &format!("peer-{i}"), addr("10.0.5.1", 26379 + i as u16))
                .unwrap();
        }
        c
    }

    #[tokio::test]
    async fn at_most_one_vote_per_epoch() {
        let mut c = coordinator(2, 0);
        let (vote, epoch) = c.vote_for_leader("cache", 5, "candidate-a").await;
        assert_eq!((vote.as_str(), epoch), ("candidate-a", 5));

        // A second candidate in the same epoch gets the recorded vote back.
        let (vote, epoch) = c.vote_for_leader("cache", 5, "candidate-b").await;
        assert_eq!((vote.as_str(), epoch), ("candidate-a", 5));

        // A later epoch is a fresh ballot.
        let (vote, epoch) = c.vote_for_leader("cache", 6, "candidate-b").await;
        assert_eq!((vote.as_str(), epoch), ("candidate-b", 6));
        assert_eq!(c.current_epoch, 6);
    }

    #[tokio::test]
    async fn voting_raises_current_epoch() {
        let mut c = coordinator(2, 0);
        assert_eq!(c.current_epoch, 0);
        c.vote_for_leader("cache", 9, "candidate-a").await;
        assert_eq!(c.current_epoch, 9);
    }

    #[test]
    fn leader_needs_majority_and_quorum() {
        // Five voters total (four peers plus ourselves), quorum four.
        let mut c = coordinator(4, 4);
        let me = c.run_id.clone();
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.leader = Some(me.clone());
            primary.leader_epoch = 3;
            for (i, peer) in primary.peers.values_mut().enumerate() {
                if i < 2 {
                    peer.voted_leader = Some(me.clone());
                    peer.voted_leader_epoch = 3;
                }
            }
        }
        // Three of five votes: a majority, but below the quorum of four.
        assert_eq!(c.leader_for_epoch("cache", 3), None);

        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            for peer in primary.peers.values_mut() {
                peer.voted_leader = Some(me.clone());
                peer.voted_leader_epoch = 3;
            }
        }
        assert_eq!(c.leader_for_epoch("cache", 3), Some(me));
    }

    #[test]
    fn stale_epoch_votes_do_not_count() {
        let mut c = coordinator(1, 1);
        let me = c.run_id.clone();
        {
            let primary = c.registry.primaries.get_mut("cache").unwrap();
            primary.leader = Some(me.clone());
            primary.leader_epoch = 2;
            let peer = primary.peers.get_mut("peer-0").unwrap();
            peer.voted_leader = Some(me.clone());
            peer.voted_leader_epoch = 1; // older ballot
        }
        // One vote of two voters: no majority.
        assert_eq!(c.leader_for_epoch("cache", 2), None);
    }
}
