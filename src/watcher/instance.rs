// src/watcher/instance.rs

//! The three kinds of monitored things a watcher keeps book on: the primary
//! of a topology, its replicas, and the peer watchers monitoring the same
//! primary. Each is its own type carrying only its relevant fields; there is
//! no flag-bit role encoding.

use super::addr::InstanceAddr;
use super::events::LinkId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The role an instance self-reports over `INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
    Unknown,
}

/// Failover progress for a primary. Transitions only move forward, or back to
/// `None` through an explicit abort (allowed up to `WaitPromotion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    None,
    /// Waiting to be confirmed leader for the failover epoch.
    WaitStart,
    /// Choosing the replica to promote.
    SelectReplica,
    /// `REPLICAOF NO ONE` is being sent to the chosen replica.
    SendPromote,
    /// Waiting for the chosen replica to self-report the primary role.
    WaitPromotion,
    /// Pointing the remaining replicas at the new primary.
    ReconfigureReplicas,
    /// Rewriting the topology around the promoted replica.
    UpdateTopology,
}

impl FailoverState {
    pub fn rank(self) -> u8 {
        match self {
            FailoverState::None => 0,
            FailoverState::WaitStart => 1,
            FailoverState::SelectReplica => 2,
            FailoverState::SendPromote => 3,
            FailoverState::WaitPromotion => 4,
            FailoverState::ReconfigureReplicas => 5,
            FailoverState::UpdateTopology => 6,
        }
    }

    /// Abort is only permitted before replicas start being rewritten.
    pub fn can_abort(self) -> bool {
        self != FailoverState::None && self.rank() <= FailoverState::WaitPromotion.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailoverState::None => "none",
            FailoverState::WaitStart => "wait_start",
            FailoverState::SelectReplica => "select_replica",
            FailoverState::SendPromote => "send_promote",
            FailoverState::WaitPromotion => "wait_promotion",
            FailoverState::ReconfigureReplicas => "reconf_replicas",
            FailoverState::UpdateTopology => "update_topology",
        }
    }
}

/// Reconfiguration progress of one replica during `ReconfigureReplicas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigStage {
    None,
    /// `REPLICAOF <new primary>` sent, not yet acknowledged via INFO.
    Sent,
    /// The replica reports the new primary but its link is still syncing.
    InProgress,
    Done,
}

/// Tunable, per-primary options. Defaults mirror the usual deployment values.
#[derive(Debug, Clone)]
pub struct PrimaryOptions {
    pub quorum: usize,
    pub down_after: Duration,
    pub failover_timeout: Duration,
    pub parallel_syncs: usize,
    pub auth_pass: Option<String>,
    /// Grace period after an observed reboot before the primary counts as
    /// down. Zero disables reboot detection.
    pub reboot_down_after: Duration,
    /// Directive renaming table for deployments that alias admin commands on
    /// the data nodes.
    pub rename_commands: HashMap<String, String>,
}

impl Default for PrimaryOptions {
    fn default() -> Self {
        Self {
            quorum: 2,
            down_after: Duration::from_secs(30),
            failover_timeout: Duration::from_secs(180),
            parallel_syncs: 1,
            auth_pass: None,
            reboot_down_after: Duration::ZERO,
            rename_commands: HashMap::new(),
        }
    }
}

impl PrimaryOptions {
    /// Resolves a directive through the renaming table.
    pub fn directive<'a>(&'a self, cmd: &'a str) -> &'a str {
        self.rename_commands.get(cmd).map_or(cmd, |s| s.as_str())
    }
}

#[derive(Debug)]
pub struct PrimaryInstance {
    pub name: String,
    pub addr: InstanceAddr,
    pub run_id: Option<String>,
    pub options: PrimaryOptions,
    pub link: LinkId,

    pub role_reported: Role,
    pub role_reported_at: Instant,
    /// Set when INFO shows a changed run id: the node rebooted.
    pub reboot_at: Option<Instant>,
    pub info_refresh: Option<Instant>,

    pub sdown_since: Option<Instant>,
    pub odown_since: Option<Instant>,

    pub config_epoch: u64,
    /// Epoch of the failover currently in progress (or the last one run).
    pub failover_epoch: u64,
    /// Vote cast in `leader_epoch`; at most one per epoch.
    pub leader: Option<String>,
    pub leader_epoch: u64,

    pub failover_state: FailoverState,
    pub failover_started_at: Instant,
    pub failover_state_changed_at: Instant,
    /// Random delay applied before bidding, desynchronizing concurrent
    /// watchers that saw the failure at the same instant.
    pub failover_start_delay: Duration,
    pub last_failover_attempt: Option<Instant>,
    /// Set by the operator FAILOVER command: skip odown and the election.
    pub failover_forced: bool,
    /// Addr key of the replica selected for promotion.
    pub promoted: Option<String>,

    pub replicas: HashMap<String, ReplicaInstance>,
    pub peers: HashMap<String, PeerWatcher>,
}

impl PrimaryInstance {
    pub fn new(name: String, addr: InstanceAddr, link: LinkId, options: PrimaryOptions) -> Self {
        let now = Instant::now();
        Self {
            name,
            addr,
            run_id: None,
            options,
            link,
            role_reported: Role::Unknown,
            role_reported_at: now,
            reboot_at: None,
            info_refresh: None,
            sdown_since: None,
            odown_since: None,
            config_epoch: 0,
            failover_epoch: 0,
            leader: None,
            leader_epoch: 0,
            failover_state: FailoverState::None,
            failover_started_at: now,
            failover_state_changed_at: now,
            failover_start_delay: Duration::ZERO,
            last_failover_attempt: None,
            failover_forced: false,
            promoted: None,
            replicas: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    pub fn is_sdown(&self) -> bool {
        self.sdown_since.is_some()
    }

    pub fn is_odown(&self) -> bool {
        self.odown_since.is_some()
    }

    pub fn failover_in_progress(&self) -> bool {
        self.failover_state != FailoverState::None
    }

    /// Moves the failover machine forward. Transitions are strictly ordered;
    /// anything else is a programming error.
    pub fn set_failover_state(&mut self, state: FailoverState, now: Instant) {
        debug_assert!(
            state == FailoverState::None || state.rank() > self.failover_state.rank(),
            "failover state may only advance: {:?} -> {:?}",
            self.failover_state,
            state
        );
        self.failover_state = state;
        self.failover_state_changed_at = now;
    }

    /// Clears all failover bookkeeping, including per-replica stages.
    pub fn clear_failover(&mut self, now: Instant) {
        if let Some(key) = self.promoted.take()
            && let Some(replica) = self.replicas.get_mut(&key)
        {
            replica.promoted = false;
        }
        for replica in self.replicas.values_mut() {
            replica.reconfig = ReconfigStage::None;
        }
        self.failover_state = FailoverState::None;
        self.failover_state_changed_at = now;
        self.failover_forced = false;
    }

    pub fn flags_string(&self, disconnected: bool) -> String {
        let mut flags = vec!["master"];
        if self.sdown_since.is_some() {
            flags.push("s_down");
        }
        if self.odown_since.is_some() {
            flags.push("o_down");
        }
        if self.failover_in_progress() {
            flags.push("failover_in_progress");
        }
        if disconnected {
            flags.push("disconnected");
        }
        flags.join(",")
    }
}

#[derive(Debug)]
pub struct ReplicaInstance {
    pub addr: InstanceAddr,
    pub run_id: Option<String>,
    pub link: LinkId,

    pub role_reported: Role,
    pub role_reported_at: Instant,
    pub info_refresh: Option<Instant>,
    pub sdown_since: Option<Instant>,

    /// What the replica itself says about its replication source.
    pub reported_primary_host: Option<String>,
    pub reported_primary_port: u16,
    pub primary_link_up: bool,
    pub primary_link_down_time: Duration,
    pub repl_offset: u64,
    pub priority: u32,

    pub promoted: bool,
    pub reconfig: ReconfigStage,
    pub reconfig_changed_at: Instant,
}

impl ReplicaInstance {
    pub fn new(addr: InstanceAddr, link: LinkId) -> Self {
        let now = Instant::now();
        Self {
            addr,
            run_id: None,
            link,
            role_reported: Role::Unknown,
            role_reported_at: now,
            info_refresh: None,
            sdown_since: None,
            reported_primary_host: None,
            reported_primary_port: 0,
            primary_link_up: false,
            primary_link_down_time: Duration::ZERO,
            repl_offset: 0,
            priority: 100,
            promoted: false,
            reconfig: ReconfigStage::None,
            reconfig_changed_at: now,
        }
    }

    pub fn is_sdown(&self) -> bool {
        self.sdown_since.is_some()
    }

    pub fn set_reconfig(&mut self, stage: ReconfigStage, now: Instant) {
        self.reconfig = stage;
        self.reconfig_changed_at = now;
    }

    pub fn flags_string(&self, disconnected: bool) -> String {
        let mut flags = vec!["slave"];
        if self.sdown_since.is_some() {
            flags.push("s_down");
        }
        if self.promoted {
            flags.push("promoted");
        }
        if disconnected {
            flags.push("disconnected");
        }
        flags.join(",")
    }
}

/// A peer watcher monitoring the same primary, keyed by its run id. The link
/// may be shared with records for the same identity under other primaries.
#[derive(Debug)]
pub struct PeerWatcher {
    pub run_id: String,
    pub addr: InstanceAddr,
    pub link: LinkId,

    pub last_hello: Option<Instant>,
    pub last_ask: Option<Instant>,

    /// Latest answer to the is-down RPC.
    pub down_reported: bool,
    pub down_reply_at: Option<Instant>,
    /// The vote this peer last disclosed, and for which epoch.
    pub voted_leader: Option<String>,
    pub voted_leader_epoch: u64,
}

impl PeerWatcher {
    pub fn new(run_id: String, addr: InstanceAddr, link: LinkId) -> Self {
        Self {
            run_id,
            addr,
            link,
            last_hello: None,
            last_ask: None,
            down_reported: false,
            down_reply_at: None,
            voted_leader: None,
            voted_leader_epoch: 0,
        }
    }

    /// Whether this peer's down report is fresh enough to count toward the
    /// objective verdict.
    pub fn down_report_valid(&self, now: Instant, validity: Duration) -> bool {
        self.down_reported
            && self
                .down_reply_at
                .is_some_and(|at| now.duration_since(at) <= validity)
    }

    pub fn flags_string(&self, disconnected: bool) -> String {
        let mut flags = vec!["sentinel"];
        if disconnected {
            flags.push("disconnected");
        }
        flags.join(",")
    }
}

/// What an `INFO replication` reply tells us about an instance.
#[derive(Debug, Default, Clone)]
pub struct InfoReport {
    pub run_id: Option<String>,
    pub role: Option<Role>,
    pub primary_host: Option<String>,
    pub primary_port: Option<u16>,
    pub primary_link_up: Option<bool>,
    pub primary_link_down_time: Option<Duration>,
    pub repl_offset: Option<u64>,
    pub priority: Option<u32>,
    /// (host, port, offset) triples from the primary's replica listing.
    pub replicas: Vec<(String, u16, u64)>,
}

/// Parses the handful of `INFO` lines the watcher cares about. Anything it
/// does not recognize is skipped; monitored nodes are not required to speak
/// an identical dialect.
pub fn parse_info(text: &str) -> InfoReport {
    let mut report = InfoReport::default();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(val) = line.strip_prefix("run_id:") {
            report.run_id = Some(val.trim().to_string());
        } else if let Some(val) = line.strip_prefix("role:") {
            report.role = Some(match val.trim() {
                "master" => Role::Primary,
                "slave" => Role::Replica,
                _ => Role::Unknown,
            });
        } else if let Some(val) = line.strip_prefix("master_host:") {
            report.primary_host = Some(val.trim().to_string());
        } else if let Some(val) = line.strip_prefix("master_port:") {
            report.primary_port = val.trim().parse().ok();
        } else if let Some(val) = line.strip_prefix("master_link_status:") {
            report.primary_link_up = Some(val.trim() == "up");
        } else if let Some(val) = line.strip_prefix("master_link_down_since_seconds:") {
            report.primary_link_down_time = val
                .trim()
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs);
        } else if let Some(val) = line.strip_prefix("slave_repl_offset:") {
            report.repl_offset = val.trim().parse().ok();
        } else if let Some(val) = line.strip_prefix("slave_priority:") {
            report.priority = val.trim().parse().ok();
        } else if line.starts_with("slave")
            && let Some((_, val)) = line.split_once(':')
        {
            let fields: HashMap<&str, &str> =
                val.split(',').filter_map(|p| p.split_once('=')).collect();
            if let (Some(host), Some(port)) = (fields.get("ip"), fields.get("port"))
                && let Ok(port) = port.parse::<u16>()
            {
                let offset = fields
                    .get("offset")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                report.replicas.push((host.to_string(), port, offset));
            }
        }
    }
    report
}
