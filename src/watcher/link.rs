// src/watcher/link.rs

//! Reference-counted connection links.
//!
//! A `Link` bundles the two logical channels to one physical peer: the
//! command channel and the pub/sub channel. Instances never own a link
//! directly; they hold a `LinkId` into the `LinkSet`, and peer watchers that
//! resolve to the same identity across different monitored primaries share a
//! single link. That keeps outbound connections and liveness probes bounded
//! by the number of distinct physical peers.

use super::addr::InstanceAddr;
use super::events::{LinkId, LinkRequest};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Per-link cap on in-flight commands. When full, periodic commands are
/// simply skipped until the backlog drains; this is the back-pressure valve
/// for a wedged endpoint.
pub const MAX_PENDING_COMMANDS: u32 = 100;

/// Capacity of the channel feeding a command IO task.
pub const LINK_QUEUE_DEPTH: usize = MAX_PENDING_COMMANDS as usize + 16;

#[derive(Debug)]
pub struct CmdConn {
    pub tx: mpsc::Sender<LinkRequest>,
    /// False until the IO task reports `CmdUp`.
    pub ready: bool,
    pub connected_at: Instant,
}

#[derive(Debug)]
pub struct PubsubConn {
    /// Dropping this sender shuts the pub/sub IO task down.
    pub shutdown: mpsc::Sender<()>,
    pub ready: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug)]
pub struct Link {
    pub addr: InstanceAddr,
    pub refcount: u32,
    /// Bumped on every command-channel disconnect/reconnect; command events
    /// from an older generation are discarded instead of being delivered into
    /// recycled state. Per channel, so recycling one channel never strands
    /// traffic on the other.
    pub cmd_generation: u64,
    /// Same, for the pub/sub channel.
    pub pubsub_generation: u64,
    pub cmd: Option<CmdConn>,
    pub pubsub: Option<PubsubConn>,
    pub pending: u32,
    /// Time of the oldest ping still waiting for a reply.
    pub act_ping: Option<Instant>,
    pub last_ping_sent: Instant,
    /// Last accepted liveness reply; the failure detector keys off this.
    pub last_ack: Instant,
    /// Last ping reply of any shape.
    pub last_pong: Instant,
    pub last_cmd_attempt: Option<Instant>,
    pub last_pubsub_attempt: Option<Instant>,
    pub last_hello_sent: Option<Instant>,
    pub last_info_sent: Option<Instant>,
}

impl Link {
    fn new(addr: InstanceAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            refcount: 1,
            cmd_generation: 0,
            pubsub_generation: 0,
            cmd: None,
            pubsub: None,
            pending: 0,
            act_ping: None,
            last_ping_sent: now,
            last_ack: now,
            last_pong: now,
            last_cmd_attempt: None,
            last_pubsub_attempt: None,
            last_hello_sent: None,
            last_info_sent: None,
        }
    }

    pub fn cmd_ready(&self) -> bool {
        self.cmd.as_ref().is_some_and(|c| c.ready)
    }

    pub fn has_capacity(&self) -> bool {
        self.pending < MAX_PENDING_COMMANDS
    }

    /// Tears down the command channel. The IO task notices its queue sender
    /// is gone and exits; the generation bump strands any in-flight replies.
    pub fn drop_cmd_conn(&mut self) {
        self.cmd = None;
        self.pending = 0;
        self.act_ping = None;
        self.cmd_generation += 1;
    }

    pub fn drop_pubsub_conn(&mut self) {
        self.pubsub = None;
        self.pubsub_generation += 1;
    }

    /// True when the command channel has been open long enough and a ping has
    /// gone unanswered for more than `overdue` — time to recycle it.
    pub fn cmd_is_stale(&self, now: Instant, min_age: Duration, overdue: Duration) -> bool {
        let Some(conn) = &self.cmd else { return false };
        if !conn.ready || now.duration_since(conn.connected_at) < min_age {
            return false;
        }
        self.act_ping
            .is_some_and(|sent| now.duration_since(sent) > overdue)
    }

    /// True when the pub/sub channel has been silent longer than `max_silence`.
    pub fn pubsub_is_stale(&self, now: Instant, max_silence: Duration) -> bool {
        self.pubsub
            .as_ref()
            .is_some_and(|p| p.ready && now.duration_since(p.last_activity) > max_silence)
    }
}

/// Owns every link in the process, keyed by `LinkId`.
#[derive(Debug, Default)]
pub struct LinkSet {
    next_id: u64,
    links: HashMap<LinkId, Link>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh, disconnected link with refcount 1.
    pub fn alloc(&mut self, addr: InstanceAddr) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;
        self.links.insert(id, Link::new(addr));
        id
    }

    /// Takes another strong reference on an existing link.
    pub fn acquire(&mut self, id: LinkId) -> Option<u32> {
        let link = self.links.get_mut(&id)?;
        link.refcount += 1;
        Some(link.refcount)
    }

    /// Drops one reference. Teardown runs exactly once, when the count hits
    /// zero; releasing an already-gone id is a no-op so either owner path can
    /// call it safely.
    pub fn release(&mut self, id: LinkId) -> bool {
        let Some(link) = self.links.get_mut(&id) else {
            return false;
        };
        link.refcount = link.refcount.saturating_sub(1);
        if link.refcount == 0 {
            // Dropping the conn halves drops the mpsc senders, which is what
            // actually closes both channels.
            self.links.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn refcount(&self, id: LinkId) -> u32 {
        self.links.get(&id).map_or(0, |l| l.refcount)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
