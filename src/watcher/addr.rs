// src/watcher/addr.rs

//! Resolution and comparison of monitored endpoint addresses.
//!
//! An address keeps the hostname it was configured with next to the resolved
//! IP. Comparison prefers resolved IPs; when resolution was impossible the
//! hostname is compared case-insensitively so a DNS outage does not make two
//! records for the same endpoint look distinct.

use crate::core::VigilError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Eq)]
pub struct InstanceAddr {
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl InstanceAddr {
    /// Resolves `host:port` into an address. Numeric hosts short-circuit DNS.
    pub async fn resolve(host: &str, port: u16) -> Result<Self, VigilError> {
        if port == 0 {
            return Err(VigilError::InvalidPort(port.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self {
                host: host.to_string(),
                ip: Some(ip),
                port,
            });
        }
        let mut resolved = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| VigilError::UnresolvableHost(host.to_string()))?;
        let ip = resolved
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| VigilError::UnresolvableHost(host.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            ip: Some(ip),
            port,
        })
    }

    /// Builds an address from an already-resolved socket address.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            ip: Some(addr.ip()),
            port: addr.port(),
        }
    }

    /// An address parsed from "host:port" text without touching DNS, as used
    /// by gossip payloads and the persisted state file.
    pub fn parse_lazy(s: &str) -> Result<Self, VigilError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| VigilError::InvalidRequest(format!("bad address '{s}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| VigilError::InvalidPort(port.to_string()))?;
        if port == 0 {
            return Err(VigilError::InvalidPort("0".to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            ip: host.parse().ok(),
            port,
        })
    }

    /// Canonical map key: resolved IP when available, lowercased hostname
    /// otherwise.
    pub fn key(&self) -> String {
        match self.ip {
            Some(ip) => format!("{ip}:{}", self.port),
            None => format!("{}:{}", self.host.to_lowercase(), self.port),
        }
    }

    /// The string handed to `TcpStream::connect`.
    pub fn connect_target(&self) -> String {
        match self.ip {
            Some(ip) => SocketAddr::new(ip, self.port).to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl PartialEq for InstanceAddr {
    fn eq(&self, other: &Self) -> bool {
        if self.port != other.port {
            return false;
        }
        match (self.ip, other.ip) {
            (Some(a), Some(b)) => a == b,
            _ => self.host.eq_ignore_ascii_case(&other.host),
        }
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
