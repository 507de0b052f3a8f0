// src/config.rs

//! Watcher configuration: the admin endpoint, the optional state file, and
//! the set of primaries to monitor with their per-primary tunables.

use crate::watcher::instance::PrimaryOptions;
use anyhow::{Result, bail};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Address advertised in hello gossip, when the bind address is not
    /// reachable by peers (containers, NAT).
    pub announce_ip: Option<String>,

    /// Where epochs, votes and learned topology are persisted. Without it,
    /// restart guarantees are weakened but monitoring still works.
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub masters: Vec<MonitoredMaster>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredMaster {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub quorum: usize,

    #[serde(with = "humantime_serde", default = "default_down_after")]
    pub down_after: Duration,

    #[serde(with = "humantime_serde", default = "default_failover_timeout")]
    pub failover_timeout: Duration,

    #[serde(default = "default_parallel_syncs")]
    pub parallel_syncs: usize,

    pub auth_pass: Option<String>,

    /// Grace period before a rebooted primary (changed run id) counts as
    /// down. Zero disables reboot detection.
    #[serde(with = "humantime_serde", default)]
    pub reboot_down_after: Duration,

    /// Aliases for directives the data nodes expose under renamed commands.
    #[serde(default)]
    pub rename_commands: HashMap<String, String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    26379
}

fn default_down_after() -> Duration {
    Duration::from_secs(30)
}

fn default_failover_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_parallel_syncs() -> usize {
    1
}

impl Config {
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("listen port must not be zero");
        }
        let mut names = HashSet::new();
        for master in &self.masters {
            if master.name.is_empty() {
                bail!("master name must not be empty");
            }
            if !names.insert(master.name.as_str()) {
                bail!("duplicate master name '{}'", master.name);
            }
            if master.port == 0 {
                bail!("master '{}' has port zero", master.name);
            }
            if master.quorum == 0 {
                bail!("master '{}' has quorum zero", master.name);
            }
            if master.parallel_syncs == 0 {
                bail!("master '{}' has parallel_syncs zero", master.name);
            }
            if master.down_after.is_zero() {
                bail!("master '{}' has down_after zero", master.name);
            }
        }
        Ok(())
    }
}

impl MonitoredMaster {
    pub fn options(&self) -> PrimaryOptions {
        PrimaryOptions {
            quorum: self.quorum,
            down_after: self.down_after,
            failover_timeout: self.failover_timeout,
            parallel_syncs: self.parallel_syncs,
            auth_pass: self.auth_pass.clone(),
            reboot_down_after: self.reboot_down_after,
            rename_commands: self
                .rename_commands
                .iter()
                .map(|(k, v)| (k.to_uppercase(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let text = r#"
            host = "127.0.0.1"
            port = 26380
            announce_ip = "203.0.113.9"
            state_file = "/var/lib/vigil/state.toml"

            [[masters]]
            name = "cache"
            ip = "10.0.0.1"
            port = 6379
            quorum = 2
            down_after = "5s"
            failover_timeout = "1m"
            parallel_syncs = 2

            [masters.rename_commands]
            replicaof = "hidden-replicaof"

            [[masters]]
            name = "queue"
            ip = "10.0.1.1"
            port = 6379
            quorum = 3
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 26380);
        assert_eq!(config.masters.len(), 2);
        let cache = &config.masters[0];
        assert_eq!(cache.down_after, Duration::from_secs(5));
        assert_eq!(cache.failover_timeout, Duration::from_secs(60));
        let options = cache.options();
        assert_eq!(options.directive("REPLICAOF"), "hidden-replicaof");
        // Defaults apply where the file is silent.
        assert_eq!(config.masters[1].down_after, Duration::from_secs(30));
        assert_eq!(config.masters[1].parallel_syncs, 1);
    }

    #[test]
    fn rejects_duplicate_names_and_zero_quorum() {
        let text = r#"
            [[masters]]
            name = "cache"
            ip = "10.0.0.1"
            port = 6379
            quorum = 2

            [[masters]]
            name = "cache"
            ip = "10.0.0.2"
            port = 6379
            quorum = 2
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());

        let text = r#"
            [[masters]]
            name = "cache"
            ip = "10.0.0.1"
            port = 6379
            quorum = 0
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
