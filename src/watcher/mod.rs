// src/watcher/mod.rs

//! The watcher: monitoring, failure detection, leader election and automatic
//! failover for replicated primaries, coordinated with peer watchers over
//! gossip. The coordinator in `scheduler` owns all state; `conn` and
//! `listener` are the only modules that touch sockets.

pub mod addr;
pub mod commands;
pub mod conn;
pub mod detector;
pub mod election;
pub mod events;
pub mod failover;
pub mod gossip;
pub mod instance;
pub mod link;
pub mod listener;
pub mod persist;
pub mod refresh;
pub mod registry;
pub mod scheduler;

use crate::config::Config;
use addr::InstanceAddr;
use rand::RngCore;
use scheduler::Coordinator;
use std::time::{Duration, Instant};
use tracing::info;

/// Scheduler cadence. All periodic work below is expressed as multiples of
/// this tick.
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

pub const PING_PERIOD: Duration = Duration::from_secs(1);
pub const INFO_PERIOD: Duration = Duration::from_secs(10);
/// INFO cadence while a primary is down or a failover is running.
pub const INFO_PERIOD_URGENT: Duration = Duration::from_secs(1);
pub const HELLO_PERIOD: Duration = Duration::from_secs(2);
pub const ASK_PERIOD: Duration = Duration::from_secs(1);
/// How long a peer's down report keeps counting toward the quorum.
pub const ASK_REPLY_VALIDITY: Duration = Duration::from_secs(5);
/// How fresh a replica's INFO must be for it to be promotable.
pub const INFO_VALIDITY: Duration = Duration::from_secs(5);

/// A command channel younger than this is never force-recycled.
pub const MIN_RECONNECT_PERIOD: Duration = Duration::from_secs(15);
pub const CONNECT_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Per-replica budget to complete a reconfiguration step.
pub const RECONF_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on waiting to win an election, whatever the failover timeout.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_secs(10);
/// Upper bound on the random pre-bid delay.
pub const MAX_START_DELAY_MS: u64 = 1000;

pub const TILT_TRIGGER_MS: i64 = 2000;
pub const TILT_PERIOD_MS: i64 = 30_000;

/// Pub/sub channel carrying watcher hello gossip.
pub const HELLO_CHANNEL: &str = "__vigil__:hello";

/// A fresh 40-character hex run id identifying this watcher process.
pub fn generate_run_id() -> String {
    let mut buf = [0u8; 20];
    if getrandom::fill(&mut buf).is_err() {
        rand::thread_rng().fill_bytes(&mut buf);
    }
    hex::encode(buf)
}

/// Builds the coordinator from configuration plus any persisted state, then
/// runs the admin listener and the coordination loop side by side.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let run_id = generate_run_id();
    let announce_host = config
        .announce_ip
        .clone()
        .unwrap_or_else(|| config.host.clone());
    let announce = InstanceAddr {
        ip: announce_host.parse().ok(),
        host: announce_host,
        port: config.port,
    };
    let (mut coordinator, admin) =
        Coordinator::new(run_id, announce, config.state_file.clone());

    for master in &config.masters {
        let addr = InstanceAddr::resolve(&master.ip, master.port).await?;
        coordinator
            .registry
            .create_primary(&master.name, addr, master.options())?;
    }

    if let Some(path) = coordinator.state_path.clone()
        && let Some(state) = persist::load_state(&path).await?
    {
        info!("restored state from {}", path.display());
        coordinator.apply_state(state, Instant::now());
    }

    info!(
        "watcher {} monitoring {} master(s)",
        coordinator.run_id,
        coordinator.registry.primaries.len()
    );

    let bind = format!("{}:{}", config.host, config.port);
    tokio::select! {
        result = listener::run(&bind, admin) => result,
        _ = coordinator.run() => unreachable!("coordinator loop never returns"),
    }
}
