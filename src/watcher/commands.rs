// src/watcher/commands.rs

//! The admin command surface, executed inside the coordinator loop. The
//! listener only parses frames and ships them here; every handler runs with
//! full, exclusive access to the registry and replies synchronously.
//!
//! The command family keeps the `SENTINEL` name so existing client libraries
//! and tooling work unchanged against a watcher endpoint.

use super::addr::InstanceAddr;
use super::instance::PrimaryOptions;
use super::scheduler::Coordinator;
use crate::core::VigilError;
use crate::core::protocol::RespFrame;
use crate::core::RespValue;
use std::time::{Duration, Instant};
use tracing::info;
use wildmatch::WildMatch;

fn frame_text(frame: Option<&RespFrame>) -> Option<String> {
    match frame {
        Some(RespFrame::BulkString(b)) => Some(String::from_utf8_lossy(b).into_owned()),
        Some(RespFrame::SimpleString(s)) => Some(s.clone()),
        Some(RespFrame::Integer(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn err_reply(e: &VigilError) -> RespValue {
    match e {
        // These carry their own RESP error code.
        VigilError::FailoverInProgress
        | VigilError::NoSuitableReplica
        | VigilError::InsufficientQuorum(_) => RespValue::Error(e.to_string()),
        _ => RespValue::Error(format!("ERR {e}")),
    }
}

fn wrong_args(cmd: &str) -> RespValue {
    err_reply(&VigilError::WrongArgumentCount(cmd.to_lowercase()))
}

fn pairs(fields: Vec<(&str, String)>) -> RespValue {
    let mut out = Vec::with_capacity(fields.len() * 2);
    for (k, v) in fields {
        out.push(RespValue::text(k));
        out.push(RespValue::text(v));
    }
    RespValue::Array(out)
}

impl Coordinator {
    pub async fn handle_admin(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(cmd) = frame_text(args.first()) else {
            return err_reply(&VigilError::SyntaxError);
        };
        match cmd.to_ascii_uppercase().as_str() {
            "PING" => RespValue::SimpleString("PONG".into()),
            "SENTINEL" => self.handle_sentinel(&args[1..]).await,
            _ => err_reply(&VigilError::UnknownCommand(cmd)),
        }
    }

    async fn handle_sentinel(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(sub) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        let rest = &args[1..];
        match sub.to_ascii_lowercase().as_str() {
            "myid" => RespValue::text(self.run_id.clone()),
            "masters" => {
                let mut names: Vec<&String> = self.registry.primaries.keys().collect();
                names.sort();
                RespValue::Array(
                    names
                        .iter()
                        .map(|name| self.describe_primary(name))
                        .collect(),
                )
            }
            "master" => match frame_text(rest.first()) {
                Some(name) if self.registry.primaries.contains_key(&name) => {
                    self.describe_primary(&name)
                }
                Some(_) => err_reply(&VigilError::NoSuchPrimary),
                None => wrong_args("sentinel"),
            },
            "slaves" | "replicas" => match frame_text(rest.first()) {
                Some(name) => self.describe_replicas(&name),
                None => wrong_args("sentinel"),
            },
            "sentinels" => match frame_text(rest.first()) {
                Some(name) => self.describe_peers(&name),
                None => wrong_args("sentinel"),
            },
            "get-master-addr-by-name" => match frame_text(rest.first()) {
                Some(name) => match self.registry.primaries.get(&name) {
                    Some(p) => RespValue::Array(vec![
                        RespValue::text(p.addr.host.clone()),
                        RespValue::text(p.addr.port.to_string()),
                    ]),
                    None => RespValue::NullArray,
                },
                None => wrong_args("sentinel"),
            },
            "is-master-down-by-addr" => self.cmd_is_master_down(rest).await,
            "monitor" => self.cmd_monitor(rest).await,
            "remove" => self.cmd_remove(rest).await,
            "set" => self.cmd_set(rest).await,
            "reset" => self.cmd_reset(rest).await,
            "failover" => self.cmd_failover(rest),
            "ckquorum" => self.cmd_ckquorum(rest),
            other => err_reply(&VigilError::UnknownCommand(format!("sentinel {other}"))),
        }
    }

    /// `SENTINEL IS-MASTER-DOWN-BY-ADDR <ip> <port> <epoch> <runid|*>`
    ///
    /// The down/vote RPC peers send us. A `*` run id asks only for the down
    /// verdict; anything else additionally requests our vote for that run id
    /// in the given epoch.
    async fn cmd_is_master_down(&mut self, args: &[RespFrame]) -> RespValue {
        let (Some(host), Some(port), Some(epoch), Some(candidate)) = (
            frame_text(args.first()),
            frame_text(args.get(1)),
            frame_text(args.get(2)),
            frame_text(args.get(3)),
        ) else {
            return wrong_args("sentinel");
        };
        let (Ok(port), Ok(epoch)) = (port.parse::<u16>(), epoch.parse::<u64>()) else {
            return err_reply(&VigilError::NotAnInteger);
        };
        let addr = InstanceAddr {
            ip: host.parse().ok(),
            host,
            port,
        };
        let Some(name) = self.registry.primary_name_by_addr(&addr) else {
            return RespValue::Array(vec![
                RespValue::Integer(0),
                RespValue::text("*"),
                RespValue::Integer(0),
            ]);
        };
        // While tilted our own timing data is suspect: answer, but never
        // contribute a down verdict or a vote.
        let down = !self.tilt && self.registry.primaries[&name].is_sdown();
        let (leader, leader_epoch) = if candidate != "*" && !self.tilt {
            self.vote_for_leader(&name, epoch, &candidate).await
        } else {
            ("*".to_string(), 0)
        };
        RespValue::Array(vec![
            RespValue::Integer(i64::from(down)),
            RespValue::text(leader),
            RespValue::Integer(leader_epoch as i64),
        ])
    }

    /// `SENTINEL MONITOR <name> <ip> <port> <quorum>`
    async fn cmd_monitor(&mut self, args: &[RespFrame]) -> RespValue {
        let (Some(name), Some(host), Some(port), Some(quorum)) = (
            frame_text(args.first()),
            frame_text(args.get(1)),
            frame_text(args.get(2)),
            frame_text(args.get(3)),
        ) else {
            return wrong_args("sentinel");
        };
        let (Ok(port), Ok(quorum)) = (port.parse::<u16>(), quorum.parse::<usize>()) else {
            return err_reply(&VigilError::NotAnInteger);
        };
        if quorum == 0 {
            return err_reply(&VigilError::InvalidParameter("quorum".into()));
        }
        let addr = match InstanceAddr::resolve(&host, port).await {
            Ok(addr) => addr,
            Err(e) => return err_reply(&e),
        };
        let options = PrimaryOptions {
            quorum,
            ..PrimaryOptions::default()
        };
        match self.registry.create_primary(&name, addr, options) {
            Ok(()) => {
                info!("+monitor master {name} {host}:{port} quorum {quorum}");
                self.persist_state().await;
                RespValue::SimpleString("OK".into())
            }
            Err(e) => err_reply(&e),
        }
    }

    async fn cmd_remove(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(name) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        match self.registry.remove_primary(&name) {
            Ok(()) => {
                info!("-monitor master {name}");
                self.persist_state().await;
                RespValue::SimpleString("OK".into())
            }
            Err(e) => err_reply(&e),
        }
    }

    /// `SENTINEL SET <name> <option> <value> [<option> <value> ...]`
    async fn cmd_set(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(name) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        if !self.registry.primaries.contains_key(&name) {
            return err_reply(&VigilError::NoSuchPrimary);
        }
        let mut i = 1;
        while i < args.len() {
            let Some(option) = frame_text(args.get(i)) else {
                return err_reply(&VigilError::SyntaxError);
            };
            let Some(value) = frame_text(args.get(i + 1)) else {
                return wrong_args("sentinel");
            };
            let primary = self.registry.primaries.get_mut(&name).expect("checked");
            let opts = &mut primary.options;
            let result: Result<(), VigilError> = match option.to_ascii_lowercase().as_str() {
                "quorum" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|q| *q > 0)
                    .map(|q| opts.quorum = q)
                    .ok_or(VigilError::InvalidParameter(option.clone())),
                "down-after-milliseconds" => value
                    .parse::<u64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .map(|ms| opts.down_after = Duration::from_millis(ms))
                    .ok_or(VigilError::InvalidParameter(option.clone())),
                "failover-timeout" => value
                    .parse::<u64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .map(|ms| opts.failover_timeout = Duration::from_millis(ms))
                    .ok_or(VigilError::InvalidParameter(option.clone())),
                "parallel-syncs" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(|n| opts.parallel_syncs = n)
                    .ok_or(VigilError::InvalidParameter(option.clone())),
                "reboot-down-after-milliseconds" => value
                    .parse::<u64>()
                    .ok()
                    .map(|ms| opts.reboot_down_after = Duration::from_millis(ms))
                    .ok_or(VigilError::InvalidParameter(option.clone())),
                "auth-pass" => {
                    opts.auth_pass = (!value.is_empty()).then_some(value.clone());
                    Ok(())
                }
                "rename-command" => {
                    // Consumes an extra argument: <original> <alias>.
                    i += 1;
                    match frame_text(args.get(i + 1)) {
                        Some(alias) => {
                            opts.rename_commands.insert(value.to_uppercase(), alias);
                            Ok(())
                        }
                        None => Err(VigilError::WrongArgumentCount("sentinel".into())),
                    }
                }
                _ => Err(VigilError::InvalidParameter(option.clone())),
            };
            if let Err(e) = result {
                return err_reply(&e);
            }
            i += 2;
        }
        self.persist_state().await;
        RespValue::SimpleString("OK".into())
    }

    /// `SENTINEL RESET <pattern>`: forgets learned state for every matching
    /// primary and reports how many matched.
    async fn cmd_reset(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(pattern) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        let matcher = WildMatch::new(&pattern);
        let matching: Vec<String> = self
            .registry
            .primaries
            .keys()
            .filter(|name| matcher.matches(name))
            .cloned()
            .collect();
        let now = Instant::now();
        for name in &matching {
            info!("+reset-master {name}");
            let _ = self.registry.reset_primary(name, now);
        }
        if !matching.is_empty() {
            self.persist_state().await;
        }
        RespValue::Integer(matching.len() as i64)
    }

    /// `SENTINEL FAILOVER <name>`: operator-forced failover, skipping both
    /// the objective-down requirement and the election.
    fn cmd_failover(&mut self, args: &[RespFrame]) -> RespValue {
        let Some(name) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        let Some(primary) = self.registry.primaries.get_mut(&name) else {
            return err_reply(&VigilError::NoSuchPrimary);
        };
        if primary.failover_in_progress() {
            return err_reply(&VigilError::FailoverInProgress);
        }
        info!("+failover-forced master {name}");
        primary.failover_forced = true;
        primary.last_failover_attempt = None;
        RespValue::SimpleString("OK".into())
    }

    /// `SENTINEL CKQUORUM <name>`: checks whether the currently reachable
    /// watchers suffice for both the down quorum and failover authorization.
    fn cmd_ckquorum(&self, args: &[RespFrame]) -> RespValue {
        let Some(name) = frame_text(args.first()) else {
            return wrong_args("sentinel");
        };
        let Some(primary) = self.registry.primaries.get(&name) else {
            return err_reply(&VigilError::NoSuchPrimary);
        };
        let usable = 1 + primary
            .peers
            .values()
            .filter(|p| {
                self.registry
                    .links
                    .get(p.link)
                    .is_some_and(|l| l.cmd_ready())
            })
            .count();
        let quorum = primary.options.quorum;
        let majority = (primary.peers.len() + 1) / 2 + 1;
        if usable < quorum {
            return err_reply(&VigilError::InsufficientQuorum(format!(
                "{usable} usable watchers, quorum is {quorum}"
            )));
        }
        if usable < majority {
            return err_reply(&VigilError::InsufficientQuorum(format!(
                "{usable} usable watchers, but a majority of {majority} is needed to authorize a failover"
            )));
        }
        RespValue::SimpleString(format!(
            "OK {usable} usable watchers. Quorum and failover authorization can be reached"
        ))
    }

    fn describe_primary(&self, name: &str) -> RespValue {
        let Some(p) = self.registry.primaries.get(name) else {
            return RespValue::NullArray;
        };
        let link = self.registry.links.get(p.link);
        let disconnected = link.is_none_or(|l| !l.cmd_ready());
        let pending = link.map_or(0, |l| l.pending);
        let last_ok = link.map_or(0, |l| l.last_ack.elapsed().as_millis());
        pairs(vec![
            ("name", p.name.clone()),
            ("ip", p.addr.host.clone()),
            ("port", p.addr.port.to_string()),
            ("runid", p.run_id.clone().unwrap_or_default()),
            ("flags", p.flags_string(disconnected)),
            ("link-pending-commands", pending.to_string()),
            ("last-ok-ping-reply", last_ok.to_string()),
            (
                "role-reported",
                match p.role_reported {
                    super::instance::Role::Primary => "master".into(),
                    super::instance::Role::Replica => "slave".into(),
                    super::instance::Role::Unknown => "unknown".into(),
                },
            ),
            ("config-epoch", p.config_epoch.to_string()),
            ("num-slaves", p.replicas.len().to_string()),
            ("num-other-sentinels", p.peers.len().to_string()),
            ("quorum", p.options.quorum.to_string()),
            (
                "down-after-milliseconds",
                p.options.down_after.as_millis().to_string(),
            ),
            (
                "failover-timeout",
                p.options.failover_timeout.as_millis().to_string(),
            ),
            ("parallel-syncs", p.options.parallel_syncs.to_string()),
            ("failover-state", p.failover_state.as_str().to_string()),
        ])
    }

    fn describe_replicas(&self, name: &str) -> RespValue {
        let Some(p) = self.registry.primaries.get(name) else {
            return err_reply(&VigilError::NoSuchPrimary);
        };
        let mut keys: Vec<&String> = p.replicas.keys().collect();
        keys.sort();
        RespValue::Array(
            keys.into_iter()
                .map(|key| {
                    let r = &p.replicas[key];
                    let disconnected = self
                        .registry
                        .links
                        .get(r.link)
                        .is_none_or(|l| !l.cmd_ready());
                    pairs(vec![
                        ("name", key.clone()),
                        ("ip", r.addr.host.clone()),
                        ("port", r.addr.port.to_string()),
                        ("runid", r.run_id.clone().unwrap_or_default()),
                        ("flags", r.flags_string(disconnected)),
                        (
                            "master-link-status",
                            if r.primary_link_up { "ok" } else { "err" }.to_string(),
                        ),
                        (
                            "master-host",
                            r.reported_primary_host.clone().unwrap_or_default(),
                        ),
                        ("master-port", r.reported_primary_port.to_string()),
                        ("slave-priority", r.priority.to_string()),
                        ("slave-repl-offset", r.repl_offset.to_string()),
                    ])
                })
                .collect(),
        )
    }

    fn describe_peers(&self, name: &str) -> RespValue {
        let Some(p) = self.registry.primaries.get(name) else {
            return err_reply(&VigilError::NoSuchPrimary);
        };
        let mut ids: Vec<&String> = p.peers.keys().collect();
        ids.sort();
        RespValue::Array(
            ids.into_iter()
                .map(|id| {
                    let peer = &p.peers[id];
                    let disconnected = self
                        .registry
                        .links
                        .get(peer.link)
                        .is_none_or(|l| !l.cmd_ready());
                    pairs(vec![
                        ("name", peer.run_id.clone()),
                        ("ip", peer.addr.host.clone()),
                        ("port", peer.addr.port.to_string()),
                        ("runid", peer.run_id.clone()),
                        ("flags", peer.flags_string(disconnected)),
                        (
                            "voted-leader",
                            peer.voted_leader.clone().unwrap_or_else(|| "?".into()),
                        ),
                        ("voted-leader-epoch", peer.voted_leader_epoch.to_string()),
                    ])
                })
                .collect(),
        )
    }
}
