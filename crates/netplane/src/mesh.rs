//! Mesh Overlay
//!
//! Topology types and the engine contract for the peer-to-peer mesh
//! network that runs beside (or instead of) the VPN tunnel.

use crate::keys::{PrivateKey, PublicKey};
use crate::tunnel::TunnelHandle;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Address range reserved for mesh peers (CGNAT space)
pub const DEFAULT_MESH_SUBNET: IpNet =
    IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(100, 64, 0, 0), 10));

/// This machine as seen by the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMachine {
    pub public_key: PublicKey,
    pub hostname: String,
    #[serde(default)]
    pub nickname: String,
    pub address: IpAddr,
}

/// A remote mesh peer and the permissions this machine grants it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPeer {
    pub public_key: PublicKey,
    pub hostname: String,
    #[serde(default)]
    pub nickname: String,
    /// Mesh address, absent until the peer is registered
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Peer may open connections to this machine
    #[serde(default)]
    pub allows_inbound: bool,
    /// Peer may route its traffic through this machine
    #[serde(default)]
    pub allows_routing: bool,
    /// Peer may reach this machine's LAN when routing
    #[serde(default)]
    pub allows_local_network: bool,
    /// Peer may send files to this machine
    #[serde(default)]
    pub allows_fileshare: bool,
}

impl MeshPeer {
    /// Whether the peer may reach local private networks
    pub fn lan_allowed(&self) -> bool {
        self.allows_routing && self.allows_local_network
    }
}

/// Full mesh topology: this machine plus its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshTopology {
    pub machine: MeshMachine,
    #[serde(default)]
    pub peers: Vec<MeshPeer>,
}

impl MeshTopology {
    /// Find a peer by public key
    pub fn peer(&self, public_key: &PublicKey) -> Option<&MeshPeer> {
        self.peers.iter().find(|peer| &peer.public_key == public_key)
    }
}

/// Connection status of one mesh peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

/// Mesh engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("Failed to enable mesh: {0}")]
    Enable(String),

    #[error("Failed to disable mesh: {0}")]
    Disable(String),

    #[error("Failed to apply mesh topology: {0}")]
    Refresh(String),

    #[error("Mesh engine is not running")]
    NotRunning,
}

/// The mesh overlay engine
#[async_trait]
pub trait Mesh: Send + Sync {
    /// Bring the overlay up with this machine's address and identity
    async fn enable(&self, self_addr: IpAddr, private_key: &PrivateKey) -> Result<(), MeshError>;

    async fn disable(&self) -> Result<(), MeshError>;

    /// Apply a new peer topology
    async fn refresh(&self, topology: &MeshTopology) -> Result<(), MeshError>;

    /// Mesh tunnel device, `None` while down
    fn tun(&self) -> Option<Arc<dyn TunnelHandle>>;

    fn is_active(&self) -> bool;

    async fn status_map(&self) -> Result<HashMap<PublicKey, PeerStatus>, MeshError>;
}
