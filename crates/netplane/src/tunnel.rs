//! VPN Tunnel
//!
//! Contracts for a tunnel implementation (OpenVPN, WireGuard, ...). The
//! orchestrator brings tunnels up and down and reads their device and
//! counters, it never looks inside them.

use crate::config::{Credentials, ServerData, Technology};
use crate::device::Interface;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Tunnel state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Tunnel is not connected
    #[default]
    Disconnected,
    /// Tunnel is active
    Connected,
}

impl TunnelState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }
}

/// Byte counters of a tunnel device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRates {
    pub rx: u64,
    pub tx: u64,
}

impl TransferRates {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {:.2}MB, TX: {:.2}MB",
            self.rx as f64 / (1024.0 * 1024.0),
            self.tx as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Tunnel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to start tunnel to {server}: {reason}")]
    Start { server: String, reason: String },

    #[error("Failed to stop tunnel: {0}")]
    Stop(String),

    #[error("Tunnel device is down")]
    DeviceDown,

    #[error("Failed to read transfer rates: {0}")]
    Stats(String),
}

/// A live tunnel device
pub trait TunnelHandle: Send + Sync {
    /// Network interface of the tunnel
    fn interface(&self) -> Interface;

    /// Addresses assigned to the tunnel device
    fn ips(&self) -> Vec<IpAddr>;

    fn transfer_rates(&self) -> Result<TransferRates, TunnelError>;
}

/// A VPN tunnel implementation
#[async_trait]
pub trait Vpn: Send + Sync {
    /// Bring the tunnel up for one server
    async fn start(&self, creds: &Credentials, server: &ServerData) -> Result<(), TunnelError>;

    /// Bring the tunnel down. Stopping a stopped tunnel is not an error.
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Tunnel device, `None` while down
    fn tun(&self) -> Option<Arc<dyn TunnelHandle>>;

    fn is_active(&self) -> bool;

    fn technology(&self) -> Technology;
}
