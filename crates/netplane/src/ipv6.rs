//! IPv6 Blocking
//!
//! Globally blocks or permits IPv6 traffic at the OS level.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// IPv6 blocker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Ipv6Error {
    #[error("Writing IPv6 setting failed: {0}")]
    Write(String),
}

/// Blocks and unblocks IPv6 traffic
#[async_trait]
pub trait Ipv6Blocker: Send + Sync {
    async fn block(&self) -> Result<(), Ipv6Error>;
    async fn unblock(&self) -> Result<(), Ipv6Error>;
}

/// Blocks IPv6 through the `disable_ipv6` sysctl
pub struct SysctlIpv6Blocker {
    path: PathBuf,
}

impl SysctlIpv6Blocker {
    /// Create a blocker over `net.ipv6.conf.all.disable_ipv6`
    pub fn new() -> Self {
        Self::with_path(PathBuf::from("/proc/sys/net/ipv6/conf/all/disable_ipv6"))
    }

    /// Create a blocker over a custom sysctl path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn write(&self, value: &str) -> Result<(), Ipv6Error> {
        debug!(path = %self.path.display(), value, "writing ipv6 sysctl");
        tokio::fs::write(&self.path, value)
            .await
            .map_err(|e| Ipv6Error::Write(e.to_string()))
    }
}

impl Default for SysctlIpv6Blocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ipv6Blocker for SysctlIpv6Blocker {
    async fn block(&self) -> Result<(), Ipv6Error> {
        self.write("1").await
    }

    async fn unblock(&self) -> Result<(), Ipv6Error> {
        self.write("0").await
    }
}
