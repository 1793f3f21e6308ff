//! Routing
//!
//! Routes into the dedicated policy-routing table, the ip-rule redirection
//! that makes the table effective, and default gateway discovery.

mod gateway;
mod router;

pub use gateway::{GatewayCache, GatewayError, GatewayRetriever, ProcRouteGateway};
pub use router::{NoopRouteAgent, Router};

use crate::device::Interface;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A route to a subnet, optionally through a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub subnet: IpNet,
    pub gateway: Option<IpAddr>,
    pub device: Interface,
    /// Routing table, `0` for the main table
    pub table_id: u32,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subnet)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        write!(f, " dev {} table {}", self.device.name, self.table_id)
    }
}

/// Routing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Route to {0} already exists with a different destination")]
    RouteToOtherDestinationExists(IpNet),

    #[error("Routing agent error: {0}")]
    Agent(String),

    #[error("Policy routing error: {0}")]
    Policy(String),
}

/// Stateful route management used by the orchestrator
#[async_trait]
pub trait RouteService: Send + Sync {
    async fn add(&self, route: Route) -> Result<(), RouteError>;
    /// Remove every route added through this service
    async fn flush(&self) -> Result<(), RouteError>;
    /// Re-add remembered routes into `table_id`
    async fn enable(&self, table_id: u32) -> Result<(), RouteError>;
    /// Flush routes from the system while remembering them
    async fn disable(&self) -> Result<(), RouteError>;
    fn is_enabled(&self) -> bool;
}

/// Stateless route setting, implemented per platform
#[async_trait]
pub trait RouteAgent: Send + Sync {
    async fn add(&self, route: &Route) -> Result<(), RouteError>;
    async fn flush(&self) -> Result<(), RouteError>;
}

/// The ip-rule redirection into the dedicated routing table
#[async_trait]
pub trait PolicyRouting: Send + Sync {
    /// Redirect traffic not carrying the fwmark through the table,
    /// bound to `device`. `enable_local` keeps local networks reachable
    /// outside the table.
    async fn setup_routing_rules(
        &self,
        device: &Interface,
        is_ipv6: bool,
        enable_local: bool,
        lan_enabled: bool,
    ) -> Result<(), RouteError>;
    async fn cleanup_routing(&self) -> Result<(), RouteError>;
    fn table_id(&self) -> u32;
    async fn enable(&self) -> Result<(), RouteError>;
    async fn disable(&self) -> Result<(), RouteError>;
}
