//! DNS Configuration
//!
//! Resolver configuration for the tunnel interface and static host
//! records for mesh peers.

mod hosts;

pub use hosts::HostsFileSetter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// DNS errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("Failed to set nameservers on {device}: {reason}")]
    Set { device: String, reason: String },

    #[error("Failed to unset nameservers on {device}: {reason}")]
    Unset { device: String, reason: String },

    #[error("Hosts file error: {0}")]
    HostsFile(String),
}

/// Points an interface's resolver at the given nameservers
#[async_trait]
pub trait DnsSetter: Send + Sync {
    async fn set(&self, device: &str, nameservers: &[String]) -> Result<(), DnsError>;
    async fn unset(&self, device: &str) -> Result<(), DnsError>;
}

/// Publishes static host records
#[async_trait]
pub trait HostnameSetter: Send + Sync {
    async fn set_hosts(&self, hosts: Vec<Host>) -> Result<(), DnsError>;
    async fn unset_hosts(&self) -> Result<(), DnsError>;
}

/// A static host record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: IpAddr,
    pub fqdn: String,
    /// Additional names resolving to the same address
    pub domain_names: Vec<String>,
}

impl Host {
    /// Build the record for a mesh machine.
    ///
    /// With a nickname the nickname becomes the primary name and both the
    /// full and the short host name stay resolvable.
    pub fn for_mesh_machine(ip: IpAddr, hostname: &str, nickname: &str, domain: &str) -> Self {
        let suffix = format!(".{domain}");
        let short = hostname.strip_suffix(&suffix).unwrap_or(hostname).to_string();
        if nickname.is_empty() {
            Self {
                ip,
                fqdn: hostname.to_string(),
                domain_names: vec![short],
            }
        } else {
            Self {
                ip,
                fqdn: nickname.to_string(),
                domain_names: vec![
                    format!("{nickname}{suffix}"),
                    hostname.to_string(),
                    short,
                ],
            }
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.ip, self.fqdn)?;
        for name in &self.domain_names {
            write!(f, "\t{}", name)?;
        }
        Ok(())
    }
}

/// System resolvers used outside of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServers {
    servers: Vec<String>,
}

impl NameServers {
    /// Create from configured addresses
    pub fn new(servers: Vec<String>) -> Self {
        Self { servers }
    }

    /// Resolvers for the address family, IPv4 always included
    pub fn get(&self, ipv6: bool) -> Vec<String> {
        self.servers
            .iter()
            .filter(|ns| match ns.parse::<IpAddr>() {
                Ok(IpAddr::V4(_)) => true,
                Ok(IpAddr::V6(_)) => ipv6,
                Err(_) => false,
            })
            .cloned()
            .collect()
    }
}
