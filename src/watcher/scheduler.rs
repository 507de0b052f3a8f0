// src/watcher/scheduler.rs

//! The coordinator: one value owning all mutable watcher state, driven by a
//! single task. Each loop turn services exactly one of: the fixed-cadence
//! tick, an IO event from a connection task, or an admin request from the
//! listener. Nothing else touches the registry, so no locking exists
//! anywhere in the coordination engine.

use super::addr::InstanceAddr;
use super::conn;
use super::events::{
    AdminReceiver, AdminSender, CommandCtx, CommandKind, Event, EventReceiver, EventSender,
    LinkId, LinkRequest, Target,
};
use super::instance::Role;
use super::link::{CmdConn, LINK_QUEUE_DEPTH, PubsubConn};
use super::{
    CONNECT_RETRY_PERIOD, HELLO_CHANNEL, HELLO_PERIOD, INFO_PERIOD,
    INFO_PERIOD_URGENT, MIN_RECONNECT_PERIOD, PING_PERIOD, TICK_PERIOD, TILT_PERIOD_MS,
    TILT_TRIGGER_MS,
};
use crate::core::protocol::RespFrame;
use crate::watcher::registry::Registry;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

/// Wall-clock milliseconds. The tilt detector deliberately uses the wall
/// clock rather than a monotonic one: clock jumps are exactly what it is
/// there to notice.
pub fn mstime() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct Coordinator {
    pub run_id: String,
    /// The address this watcher advertises in its hello messages.
    pub announce: InstanceAddr,
    /// Monotonic, never decreases; raised by any higher epoch seen anywhere.
    pub current_epoch: u64,
    pub registry: Registry,

    pub tilt: bool,
    pub tilt_since_ms: i64,
    pub last_tick_ms: i64,

    pub state_path: Option<PathBuf>,

    events_tx: EventSender,
    events_rx: EventReceiver,
    admin_rx: AdminReceiver,
}

impl Coordinator {
    pub fn new(
        run_id: String,
        announce: InstanceAddr,
        state_path: Option<PathBuf>,
    ) -> (Self, AdminSender) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (admin_tx, admin_rx) = mpsc::channel(64);
        let coordinator = Self {
            run_id,
            announce,
            current_epoch: 0,
            registry: Registry::new(),
            tilt: false,
            tilt_since_ms: 0,
            last_tick_ms: mstime(),
            state_path,
            events_tx,
            events_rx,
            admin_rx,
        };
        (coordinator, admin_tx)
    }

    /// Runs the control loop forever.
    pub async fn run(mut self) {
        let mut ticker = time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(request) = self.admin_rx.recv() => {
                    let reply = self.handle_admin(&request.args).await;
                    let _ = request.reply.send(reply);
                }
            }
        }
    }

    /// One scheduler turn: tilt bookkeeping, link upkeep and periodic
    /// commands for every instance, then detection and the acting logic
    /// (asks, election, failover) — the latter suspended while tilted.
    pub async fn tick(&mut self) {
        self.note_tick(mstime());

        let now = Instant::now();
        let names: Vec<String> = self.registry.primaries.keys().cloned().collect();
        for name in names {
            self.tick_links(&name, now);
            self.update_sdown(&name, now);
            self.update_odown(&name, now);
            if !self.tilt {
                self.ask_peers(&name, now);
                self.maybe_start_failover(&name, now).await;
                self.advance_failover(&name, now).await;
            }
        }
    }

    /// Tilt detection: a negative or grossly oversized tick delta means the
    /// clock jumped or this process was starved. Either way our timing
    /// assumptions are void, so acting logic is suspended until a full tilt
    /// period passes at normal cadence.
    pub fn note_tick(&mut self, now_ms: i64) {
        let delta = now_ms - self.last_tick_ms;
        if delta < 0 || delta > TILT_TRIGGER_MS {
            if !self.tilt {
                warn!("entering tilt mode (tick delta {delta}ms)");
            }
            self.tilt = true;
            self.tilt_since_ms = now_ms;
        } else if self.tilt && now_ms - self.tilt_since_ms > TILT_PERIOD_MS {
            warn!("exiting tilt mode");
            self.tilt = false;
        }
        self.last_tick_ms = now_ms;
    }

    /// Link upkeep plus the periodic command schedule for one primary and
    /// everything attached to it.
    fn tick_links(&mut self, name: &str, now: Instant) {
        let Some(primary) = self.registry.primaries.get(name) else {
            return;
        };

        let auth = primary.options.auth_pass.clone();
        let down_after = primary.options.down_after;
        let urgent_info =
            primary.is_sdown() || primary.failover_in_progress();

        // (link, wants pub/sub, info target if any, auth for that endpoint)
        let mut endpoints: Vec<(LinkId, bool, Option<Target>, Option<String>)> = Vec::new();
        endpoints.push((primary.link, true, Some(Target::Primary), auth.clone()));
        for (key, replica) in &primary.replicas {
            endpoints.push((
                replica.link,
                true,
                Some(Target::Replica(key.clone())),
                auth.clone(),
            ));
        }
        for peer in primary.peers.values() {
            // Peer watchers get probed on the command channel only.
            endpoints.push((peer.link, false, None, None));
        }

        for (link_id, wants_pubsub, info_target, link_auth) in endpoints {
            self.maintain_link(link_id, wants_pubsub, &link_auth, down_after, now);
            self.send_periodic_ping(name, link_id, &info_target, now);
            if let Some(target) = info_target {
                let period = if urgent_info { INFO_PERIOD_URGENT } else { INFO_PERIOD };
                self.send_periodic_info(name, link_id, target, period, now);
            }
            if wants_pubsub {
                self.send_periodic_hello(name, link_id, now);
            }
        }
    }

    /// Reconnects closed channels (on a cooldown) and recycles stale ones.
    fn maintain_link(
        &mut self,
        link_id: LinkId,
        wants_pubsub: bool,
        auth: &Option<String>,
        down_after: Duration,
        now: Instant,
    ) {
        let Some(link) = self.registry.links.get_mut(link_id) else {
            return;
        };

        // An open command channel with a long-overdue ping is worse than a
        // closed one: recycle it and let the reconnect path take over.
        if link.cmd_is_stale(now, MIN_RECONNECT_PERIOD, down_after / 2) {
            debug!("recycling stale command channel to {}", link.addr);
            link.drop_cmd_conn();
        }
        if link.pubsub_is_stale(now, HELLO_PERIOD * 3) {
            debug!("recycling silent pub/sub channel to {}", link.addr);
            link.drop_pubsub_conn();
        }

        if link.cmd.is_none()
            && link
                .last_cmd_attempt
                .is_none_or(|at| now.duration_since(at) >= CONNECT_RETRY_PERIOD)
        {
            link.cmd_generation += 1;
            let generation = link.cmd_generation;
            let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
            link.cmd = Some(CmdConn {
                tx,
                ready: false,
                connected_at: now,
            });
            link.last_cmd_attempt = Some(now);
            tokio::spawn(conn::run_command_conn(
                link.addr.connect_target(),
                link_id,
                generation,
                auth.clone(),
                self.events_tx.clone(),
                rx,
            ));
        }

        if wants_pubsub
            && link.pubsub.is_none()
            && link
                .last_pubsub_attempt
                .is_none_or(|at| now.duration_since(at) >= CONNECT_RETRY_PERIOD)
        {
            link.pubsub_generation += 1;
            let generation = link.pubsub_generation;
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            link.pubsub = Some(PubsubConn {
                shutdown: shutdown_tx,
                ready: false,
                connected_at: now,
                last_activity: now,
            });
            link.last_pubsub_attempt = Some(now);
            tokio::spawn(conn::run_pubsub_conn(
                link.addr.connect_target(),
                link_id,
                generation,
                auth.clone(),
                HELLO_CHANNEL.to_string(),
                self.events_tx.clone(),
                shutdown_rx,
            ));
        }
    }

    fn send_periodic_ping(
        &mut self,
        name: &str,
        link_id: LinkId,
        info_target: &Option<Target>,
        now: Instant,
    ) {
        let Some(link) = self.registry.links.get(link_id) else {
            return;
        };
        if !link.cmd_ready() || now.duration_since(link.last_ping_sent) < PING_PERIOD {
            return;
        }
        let target = info_target.clone().unwrap_or_else(|| {
            // Peer link; the concrete peer id does not matter for a ping.
            Target::Peer(String::new())
        });
        let ctx = CommandCtx {
            primary: name.to_string(),
            target,
            kind: CommandKind::Ping,
        };
        if self.send_command(link_id, RespFrame::command(["PING"]), ctx) {
            let link = self.registry.links.get_mut(link_id).expect("link exists");
            link.last_ping_sent = now;
            if link.act_ping.is_none() {
                link.act_ping = Some(now);
            }
        }
    }

    fn send_periodic_info(
        &mut self,
        name: &str,
        link_id: LinkId,
        target: Target,
        period: Duration,
        now: Instant,
    ) {
        let Some(link) = self.registry.links.get(link_id) else {
            return;
        };
        if !link.cmd_ready()
            || link
                .last_info_sent
                .is_some_and(|at| now.duration_since(at) < period)
        {
            return;
        }
        let ctx = CommandCtx {
            primary: name.to_string(),
            target,
            kind: CommandKind::Info,
        };
        let frame = RespFrame::command(["INFO", "replication"]);
        if self.send_command(link_id, frame, ctx) {
            self.registry
                .links
                .get_mut(link_id)
                .expect("link exists")
                .last_info_sent = Some(now);
        }
    }

    fn send_periodic_hello(&mut self, name: &str, link_id: LinkId, now: Instant) {
        let Some(link) = self.registry.links.get(link_id) else {
            return;
        };
        if !link.cmd_ready()
            || link
                .last_hello_sent
                .is_some_and(|at| now.duration_since(at) < HELLO_PERIOD)
        {
            return;
        }
        let Some(payload) = self.build_hello(name) else {
            return;
        };
        let ctx = CommandCtx {
            primary: name.to_string(),
            target: Target::Primary,
            kind: CommandKind::Hello,
        };
        let frame = RespFrame::command([
            "PUBLISH".to_string(),
            HELLO_CHANNEL.to_string(),
            payload,
        ]);
        if self.send_command(link_id, frame, ctx) {
            self.registry
                .links
                .get_mut(link_id)
                .expect("link exists")
                .last_hello_sent = Some(now);
        }
    }

    /// Enqueues a command on a link's command channel. Fire-and-forget with a
    /// bounded in-flight count: a full or closed channel means the command is
    /// simply not sent this tick.
    pub fn send_command(&mut self, link_id: LinkId, frame: RespFrame, ctx: CommandCtx) -> bool {
        let Some(link) = self.registry.links.get_mut(link_id) else {
            return false;
        };
        let Some(cmd) = &link.cmd else {
            return false;
        };
        if !cmd.ready || !link.has_capacity() {
            return false;
        }
        match cmd.tx.try_send(LinkRequest { frame, ctx }) {
            Ok(()) => {
                link.pending += 1;
                true
            }
            Err(_) => false,
        }
    }

    /// Dispatches one IO event. Every arm first validates the event's
    /// generation against its own channel's counter: events from a recycled
    /// or released connection are dropped on the floor rather than delivered
    /// into reused state, and recycling one channel never invalidates the
    /// other's traffic.
    pub async fn handle_event(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::CmdUp { link, generation } => {
                if let Some(l) = self.cmd_link_at(link, generation)
                    && let Some(cmd) = &mut l.cmd
                {
                    cmd.ready = true;
                    cmd.connected_at = now;
                }
            }
            Event::CmdDown {
                link,
                generation,
                reason,
            } => {
                if let Some(l) = self.cmd_link_at(link, generation) {
                    debug!("command channel to {} down: {reason}", l.addr);
                    l.cmd = None;
                    l.pending = 0;
                    l.act_ping = None;
                }
            }
            Event::Reply {
                link,
                generation,
                ctx,
                frame,
            } => {
                let Some(l) = self.cmd_link_at(link, generation) else {
                    debug!("discarding reply for stale link generation");
                    return;
                };
                l.pending = l.pending.saturating_sub(1);
                self.handle_reply(link, ctx, frame, now).await;
            }
            Event::PubsubUp { link, generation } => {
                if let Some(l) = self.pubsub_link_at(link, generation)
                    && let Some(ps) = &mut l.pubsub
                {
                    ps.ready = true;
                    ps.connected_at = now;
                    ps.last_activity = now;
                }
            }
            Event::PubsubDown {
                link,
                generation,
                reason,
            } => {
                if let Some(l) = self.pubsub_link_at(link, generation) {
                    debug!("pub/sub channel to {} down: {reason}", l.addr);
                    l.pubsub = None;
                }
            }
            Event::PubsubMessage {
                link,
                generation,
                payload,
            } => {
                let Some(l) = self.pubsub_link_at(link, generation) else {
                    return;
                };
                if let Some(ps) = &mut l.pubsub {
                    ps.last_activity = now;
                }
                self.process_hello(&payload, now).await;
            }
        }
    }

    /// The link, but only if the command-channel generation is current.
    fn cmd_link_at(&mut self, link: LinkId, generation: u64) -> Option<&mut super::link::Link> {
        self.registry
            .links
            .get_mut(link)
            .filter(|l| l.cmd_generation == generation)
    }

    /// The link, but only if the pub/sub-channel generation is current.
    fn pubsub_link_at(&mut self, link: LinkId, generation: u64) -> Option<&mut super::link::Link> {
        self.registry
            .links
            .get_mut(link)
            .filter(|l| l.pubsub_generation == generation)
    }

    async fn handle_reply(
        &mut self,
        link_id: LinkId,
        ctx: CommandCtx,
        frame: RespFrame,
        now: Instant,
    ) {
        match ctx.kind {
            CommandKind::Ping => self.handle_ping_reply(link_id, frame, now),
            CommandKind::Info => {
                let RespFrame::BulkString(text) = frame else {
                    // Unexpected shape; peers need not speak our dialect.
                    return;
                };
                let text = String::from_utf8_lossy(&text).into_owned();
                self.apply_info(&ctx.primary, &ctx.target, &text, now).await;
            }
            CommandKind::AskDown => {
                if let Target::Peer(peer_id) = &ctx.target {
                    self.handle_ask_reply(&ctx.primary, peer_id, frame, now);
                }
            }
            CommandKind::Hello => {
                if let RespFrame::Error(e) = frame {
                    debug!("hello publish for '{}' refused: {e}", ctx.primary);
                }
            }
            CommandKind::Promote | CommandKind::Reconfigure => {
                if let RespFrame::Error(e) = frame {
                    debug!(
                        "directive for '{}' ({:?}) refused: {e}",
                        ctx.primary, ctx.target
                    );
                }
            }
        }
    }

    /// PONG handling. `LOADING` and `MASTERDOWN` still prove the process is
    /// alive and count as accepted liveness replies.
    fn handle_ping_reply(&mut self, link_id: LinkId, frame: RespFrame, now: Instant) {
        let Some(link) = self.registry.links.get_mut(link_id) else {
            return;
        };
        link.last_pong = now;
        let accepted = match &frame {
            RespFrame::SimpleString(s) => s.eq_ignore_ascii_case("pong"),
            RespFrame::Error(e) => {
                let e = e.to_ascii_uppercase();
                e.starts_with("LOADING") || e.starts_with("MASTERDOWN")
            }
            _ => false,
        };
        if accepted {
            link.last_ack = now;
            link.act_ping = None;
        }
    }

    /// Role change bookkeeping shared by the INFO handlers.
    pub(super) fn note_role(role: &mut Role, at: &mut Instant, reported: Role, now: Instant) {
        if *role != reported {
            *role = reported;
            *at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_coordinator() -> Coordinator {
        let announce = InstanceAddr {
            host: "127.0.0.1".into(),
            ip: Some("127.0.0.1".parse().unwrap()),
            port: 26379,
        };
        Coordinator::new("f00f".repeat(10), announce, None).0
    }

    #[test]
    fn clock_rollback_enters_tilt() {
        let mut c = test_coordinator();
        c.note_tick(1_000_000);
        assert!(!c.tilt);
        // Clock jumped backwards between ticks.
        c.note_tick(999_500);
        assert!(c.tilt);
        // Normal cadence, but the tilt period has not elapsed yet.
        c.note_tick(999_600);
        assert!(c.tilt);
        // A full tilt period at normal cadence clears it.
        let mut t = 999_600;
        while t < 999_600 + TILT_PERIOD_MS + 200 {
            t += 100;
            c.note_tick(t);
        }
        assert!(!c.tilt);
    }

    #[test]
    fn oversized_tick_delta_enters_tilt() {
        let mut c = test_coordinator();
        c.note_tick(1_000_000);
        c.note_tick(1_000_000 + TILT_TRIGGER_MS + 1);
        assert!(c.tilt);
    }

    #[tokio::test]
    async fn pubsub_recycle_does_not_strand_command_replies() {
        let mut c = test_coordinator();
        let addr = InstanceAddr {
            host: "10.0.0.1".into(),
            ip: Some("10.0.0.1".parse().unwrap()),
            port: 6379,
        };
        let id = c.registry.links.alloc(addr);
        let t0 = Instant::now();
        {
            let link = c.registry.links.get_mut(id).unwrap();
            link.cmd = Some(CmdConn {
                tx: mpsc::channel(LINK_QUEUE_DEPTH).0,
                ready: true,
                connected_at: t0,
            });
            link.pending = 1;
            link.act_ping = Some(t0);
        }
        let generation = c.registry.links.get(id).unwrap().cmd_generation;

        // The pub/sub channel goes silent and gets recycled while the ping
        // is still in flight on the healthy command channel.
        c.registry.links.get_mut(id).unwrap().drop_pubsub_conn();

        c.handle_event(Event::Reply {
            link: id,
            generation,
            ctx: CommandCtx {
                primary: "cache".into(),
                target: Target::Primary,
                kind: CommandKind::Ping,
            },
            frame: RespFrame::SimpleString("PONG".into()),
        })
        .await;

        let link = c.registry.links.get(id).unwrap();
        assert_eq!(link.pending, 0);
        assert!(link.act_ping.is_none());
        assert!(link.last_ack >= t0);
    }

    #[tokio::test]
    async fn command_recycle_does_not_kill_pubsub_session() {
        let mut c = test_coordinator();
        let addr = InstanceAddr {
            host: "10.0.0.1".into(),
            ip: Some("10.0.0.1".parse().unwrap()),
            port: 6379,
        };
        let id = c.registry.links.alloc(addr);
        let t0 = Instant::now() - Duration::from_millis(50);
        {
            let link = c.registry.links.get_mut(id).unwrap();
            link.pubsub = Some(PubsubConn {
                shutdown: mpsc::channel(1).0,
                ready: true,
                connected_at: t0,
                last_activity: t0,
            });
            link.drop_cmd_conn();
        }
        let generation = c.registry.links.get(id).unwrap().pubsub_generation;

        c.handle_event(Event::PubsubMessage {
            link: id,
            generation,
            payload: bytes::Bytes::from_static(b"not json"),
        })
        .await;

        let link = c.registry.links.get(id).unwrap();
        assert!(link.pubsub.as_ref().unwrap().last_activity > t0);
    }

    #[test]
    fn ping_reply_classification() {
        let mut c = test_coordinator();
        let addr = InstanceAddr {
            host: "10.0.0.1".into(),
            ip: Some("10.0.0.1".parse().unwrap()),
            port: 6379,
        };
        let id = c.registry.links.alloc(addr);
        let t0 = Instant::now();
        {
            let link = c.registry.links.get_mut(id).unwrap();
            link.act_ping = Some(t0);
        }
        c.handle_ping_reply(id, RespFrame::Error("BUSY script running".into()), t0);
        assert!(c.registry.links.get(id).unwrap().act_ping.is_some());

        c.handle_ping_reply(id, RespFrame::Error("LOADING data".into()), t0);
        assert!(c.registry.links.get(id).unwrap().act_ping.is_none());
    }
}
