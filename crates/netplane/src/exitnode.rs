//! Exit Node
//!
//! Contract for the forwarding role that lets mesh peers route their
//! traffic through this machine.

use crate::config::Allowlist;
use crate::mesh::MeshPeer;
use async_trait::async_trait;

/// Exit node errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitNodeError {
    #[error("Failed to enable exit node: {0}")]
    Enable(String),

    #[error("Failed to disable exit node: {0}")]
    Disable(String),

    #[error("Failed to reset forwarding rules: {0}")]
    Reset(String),
}

/// Forwarding controller for mesh peers
#[async_trait]
pub trait ExitNode: Send + Sync {
    async fn enable(&self) -> Result<(), ExitNodeError>;

    async fn disable(&self) -> Result<(), ExitNodeError>;

    /// Rebuild per-peer forwarding for the given peers.
    /// `lan_available` controls whether routed peers may reach the LAN.
    async fn reset_peers(&self, peers: &[MeshPeer], lan_available: bool)
    -> Result<(), ExitNodeError>;

    /// Recompute forwarding exceptions for a new allowlist
    async fn set_allowlist(
        &self,
        allowlist: &Allowlist,
        lan_available: bool,
    ) -> Result<(), ExitNodeError>;
}
