//! Networker Configuration
//!
//! Configuration and connection parameter types consumed by the
//! orchestrator: the allowlist, VPN credentials and server metadata,
//! and the static [`NetworkerConfig`] loaded from TOML or JSON.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Private IPv4 ranges used for LAN permissions and DNS leak protection
pub const PRIVATE_SUBNETS: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

/// Parsed form of [`PRIVATE_SUBNETS`]
pub fn private_subnets() -> Vec<IpNet> {
    PRIVATE_SUBNETS
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect()
}

/// Allowlisted ports, split by transport protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default)]
    pub tcp: BTreeSet<u16>,
    #[serde(default)]
    pub udp: BTreeSet<u16>,
}

/// Traffic exempted from the kill switch and routed outside the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub subnets: BTreeSet<IpNet>,
}

impl Allowlist {
    /// Create an allowlist from subnets only
    pub fn with_subnets<I: IntoIterator<Item = IpNet>>(subnets: I) -> Self {
        Self {
            ports: Ports::default(),
            subnets: subnets.into_iter().collect(),
        }
    }

    /// Check whether a port is allowlisted for either TCP or UDP
    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.tcp.contains(&port) || self.ports.udp.contains(&port)
    }

    /// Copy of this allowlist with the private LAN ranges added
    pub fn with_lan_permissions(&self) -> Self {
        let mut allowlist = self.clone();
        allowlist.subnets.extend(private_subnets());
        allowlist
    }

    /// Check if nothing is allowlisted
    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty() && self.ports.tcp.is_empty() && self.ports.udp.is_empty()
    }
}

/// VPN credentials handed to the tunnel implementation
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// WireGuard-style private key, when the technology needs one
    #[serde(default)]
    pub private_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("private_key", &self.private_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Tunnel technology of a VPN implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    #[default]
    Unknown,
    OpenVpn,
    WireGuard,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Unknown => write!(f, "unknown"),
            Technology::OpenVpn => write!(f, "openvpn"),
            Technology::WireGuard => write!(f, "wireguard"),
        }
    }
}

/// Transport protocol of the VPN connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Unknown,
    Udp,
    Tcp,
}

/// VPN server metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerData {
    /// Server address. Unspecified means "reuse the last server".
    pub ip: IpAddr,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ServerData {
    /// Create server data with only an address
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ..Self::default()
        }
    }

    /// Check if an address was given
    pub fn has_address(&self) -> bool {
        !self.ip.is_unspecified()
    }
}

impl Default for ServerData {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            hostname: String::new(),
            name: String::new(),
            country: String::new(),
            country_code: String::new(),
            city: String::new(),
            protocol: Protocol::Unknown,
        }
    }
}

/// Static orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkerConfig {
    /// Connection mark of the control channel, always let through
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    /// LAN discovery at startup
    #[serde(default)]
    pub lan_discovery: bool,
    /// Permit IPv6 at startup
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Resolvers used when the VPN server lives inside the mesh subnet
    #[serde(default = "default_fallback_nameservers")]
    pub fallback_nameservers: Vec<String>,
    /// Default gateway cache lifetime
    #[serde(default = "default_gateway_cache_ttl")]
    pub gateway_cache_ttl_secs: u64,
    /// Mesh DNS suffix, stripped for the short host name
    #[serde(default = "default_mesh_domain")]
    pub mesh_domain: String,
    /// Hosts file used for mesh peer records
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
}

fn default_fwmark() -> u32 {
    0xe1f1
}

fn default_fallback_nameservers() -> Vec<String> {
    vec!["103.86.96.100".to_string(), "103.86.99.100".to_string()]
}

fn default_gateway_cache_ttl() -> u64 {
    30
}

fn default_mesh_domain() -> String {
    "nord".to_string()
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

impl Default for NetworkerConfig {
    fn default() -> Self {
        Self {
            fwmark: default_fwmark(),
            lan_discovery: false,
            ipv6_enabled: false,
            fallback_nameservers: default_fallback_nameservers(),
            gateway_cache_ttl_secs: default_gateway_cache_ttl(),
            mesh_domain: default_mesh_domain(),
            hosts_file: default_hosts_file(),
        }
    }
}

impl NetworkerConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Gateway cache lifetime as a duration
    pub fn gateway_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.gateway_cache_ttl_secs)
    }

    /// Suffix stripped from mesh host names, including the leading dot
    pub fn mesh_suffix(&self) -> String {
        format!(".{}", self.mesh_domain)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bad) = self
            .fallback_nameservers
            .iter()
            .find(|ns| ns.parse::<IpAddr>().is_err())
        {
            return Err(ConfigError::InvalidNameserver(bad.clone()));
        }
        if self.mesh_domain.is_empty() {
            return Err(ConfigError::EmptyMeshDomain);
        }
        if self.gateway_cache_ttl_secs == 0 {
            return Err(ConfigError::ZeroCacheTtl);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid fallback nameserver: {0}")]
    InvalidNameserver(String),

    #[error("Mesh domain must not be empty")]
    EmptyMeshDomain,

    #[error("Gateway cache TTL must be positive")]
    ZeroCacheTtl,
}
