//! Default Gateway Discovery
//!
//! [`GatewayCache`] memoizes the default gateway per address family for a
//! short time, so applying an allowlist with many public subnets performs
//! one lookup instead of one per subnet.

use crate::device::Interface;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Gateway lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("No default {} gateway", if *.ipv6 { "IPv6" } else { "IPv4" })]
    NoDefaultGateway { ipv6: bool },

    #[error("Gateway lookup failed: {0}")]
    Lookup(String),
}

/// Looks up the current default route
#[async_trait]
pub trait GatewayRetriever: Send + Sync {
    /// Default gateway address and the interface it is reached through
    async fn default_gateway(&self, ipv6: bool) -> Result<(IpAddr, Interface), GatewayError>;
}

/// Cached gateway lookup
#[derive(Clone)]
struct CacheEntry {
    gateway: IpAddr,
    interface: Interface,
    expires_at: Instant,
}

/// Short-lived per-family cache in front of a [`GatewayRetriever`]
///
/// Failed lookups are not cached.
pub struct GatewayCache {
    retriever: Arc<dyn GatewayRetriever>,
    ttl: Duration,
    /// Index 0 for IPv4, 1 for IPv6
    entries: RwLock<[Option<CacheEntry>; 2]>,
}

impl GatewayCache {
    /// Create a new cache
    pub fn new(retriever: Arc<dyn GatewayRetriever>, ttl: Duration) -> Self {
        Self {
            retriever,
            ttl,
            entries: RwLock::new([None, None]),
        }
    }

    /// Default gateway for the address family, from cache when fresh
    pub async fn default_gateway(&self, ipv6: bool) -> Result<(IpAddr, Interface), GatewayError> {
        let slot = usize::from(ipv6);
        if let Ok(entries) = self.entries.read()
            && let Some(entry) = &entries[slot]
            && entry.expires_at > Instant::now()
        {
            return Ok((entry.gateway, entry.interface.clone()));
        }

        trace!(ipv6, "gateway cache miss");
        let (gateway, interface) = self.retriever.default_gateway(ipv6).await?;
        if let Ok(mut entries) = self.entries.write() {
            entries[slot] = Some(CacheEntry {
                gateway,
                interface: interface.clone(),
                expires_at: Instant::now() + self.ttl,
            });
        }
        Ok((gateway, interface))
    }

    /// Drop cached lookups, e.g. after a network change
    pub fn invalidate(&self) {
        if let Ok(mut entries) = self.entries.write() {
            *entries = [None, None];
        }
    }
}

/// Reads the default route from `/proc/net/route` and `/proc/net/ipv6_route`
pub struct ProcRouteGateway {
    proc_net: PathBuf,
}

impl ProcRouteGateway {
    /// Create a retriever over `/proc/net`
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/proc/net"))
    }

    /// Create a retriever over a custom directory
    pub fn with_root(proc_net: PathBuf) -> Self {
        Self { proc_net }
    }
}

impl Default for ProcRouteGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayRetriever for ProcRouteGateway {
    async fn default_gateway(&self, ipv6: bool) -> Result<(IpAddr, Interface), GatewayError> {
        let file = if ipv6 { "ipv6_route" } else { "route" };
        let content = tokio::fs::read_to_string(self.proc_net.join(file))
            .await
            .map_err(|e| GatewayError::Lookup(e.to_string()))?;
        let found = if ipv6 {
            parse_ipv6_default(&content)
        } else {
            parse_ipv4_default(&content)
        };
        found
            .map(|(gateway, name)| (gateway, Interface::new(name, 0)))
            .ok_or(GatewayError::NoDefaultGateway { ipv6 })
    }
}

/// `Iface Destination Gateway Flags ... Mask ...`, little-endian hex
fn parse_ipv4_default(content: &str) -> Option<(IpAddr, String)> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[1] != "00000000" || fields[7] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        if raw == 0 {
            return None;
        }
        let gateway = Ipv4Addr::from(raw.swap_bytes());
        Some((IpAddr::V4(gateway), fields[0].to_string()))
    })
}

/// `dest dest_len src src_len next_hop metric refcnt use flags iface`
fn parse_ipv6_default(content: &str) -> Option<(IpAddr, String)> {
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[1] != "00" || u128::from_str_radix(fields[0], 16).ok()? != 0 {
            return None;
        }
        let raw = u128::from_str_radix(fields[4], 16).ok()?;
        if raw == 0 {
            return None;
        }
        Some((IpAddr::V6(Ipv6Addr::from(raw)), fields[9].to_string()))
    })
}
