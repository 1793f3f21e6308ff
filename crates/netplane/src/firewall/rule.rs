//! Firewall Rule Model
//!
//! Declarative description of a single named rule. Translating a rule
//! into kernel rule-table operations is the job of a [`FirewallAgent`].
//!
//! [`FirewallAgent`]: super::FirewallAgent

use crate::device::Interface;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Packets a rule applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Incoming packets
    #[default]
    Inbound,
    /// Outgoing packets
    Outbound,
    /// Incoming and outgoing packets
    TwoWay,
    /// Forwarded packets
    Forward,
}

/// Which side of the connection the rule's ports refer to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortsDirection {
    #[default]
    SourceAndDestination,
    Destination,
    Source,
}

/// Connection tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Packet belongs to a known connection
    Established,
    /// Packet opens a connection related to a known one
    Related,
    /// Packet opens a new connection
    New,
}

/// Connection tracking constraint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStates {
    /// Connections originated by this address
    pub src_addr: Option<IpAddr>,
    pub states: Vec<ConnectionState>,
}

/// Protocols a rule can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpProtocol {
    Tcp,
    Udp,
    Ipv6Icmp,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "tcp"),
            IpProtocol::Udp => write!(f, "udp"),
            IpProtocol::Ipv6Icmp => write!(f, "ipv6-icmp"),
        }
    }
}

/// A single named firewall rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name
    pub name: String,
    /// Interfaces the rule is bound to (all if empty)
    pub interfaces: Vec<Interface>,
    pub remote_networks: Vec<IpNet>,
    pub local_networks: Vec<IpNet>,
    pub ports: Vec<u16>,
    pub ports_direction: PortsDirection,
    pub protocols: Vec<IpProtocol>,
    pub direction: Direction,
    pub connection_states: ConnectionStates,
    /// Packets carrying any of these connection marks
    pub marks: Vec<u32>,
    /// Accept when true, drop otherwise
    pub allow: bool,
    pub ipv6_only: bool,
    pub hop_limit: Option<u8>,
    pub icmpv6_types: Vec<u8>,
    pub comment: String,
    /// Rule lives in the mangle table, out of reach of other filter-table users
    pub physical: bool,
}

impl Rule {
    /// Create an empty rule with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
