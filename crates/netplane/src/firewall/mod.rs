//! Firewall
//!
//! Name-keyed firewall rule management. The [`FirewallService`] trait is
//! what the orchestrator consumes; [`FirewallManager`] implements it on top
//! of a [`FirewallAgent`], the boundary to the packet-filter rule compiler.

mod manager;
mod rule;

pub use manager::FirewallManager;
pub use rule::{ConnectionState, ConnectionStates, Direction, IpProtocol, PortsDirection, Rule};

use async_trait::async_trait;

/// Firewall errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FirewallError {
    #[error("Rule already exists: {0}")]
    RuleAlreadyExists(String),

    #[error("Rule has no name")]
    RuleWithoutName,

    #[error("Firewall agent error: {0}")]
    Agent(String),
}

/// Stateful rule management used by the orchestrator
#[async_trait]
pub trait FirewallService: Send + Sync {
    /// Add rules. Fails if any rule name is already present.
    async fn add(&self, rules: Vec<Rule>) -> Result<(), FirewallError>;
    /// Delete rules by name. Unknown names are ignored.
    async fn delete(&self, names: &[String]) -> Result<(), FirewallError>;
    /// Make remembered rules take effect
    async fn enable(&self) -> Result<(), FirewallError>;
    /// Remove all rules from the system while remembering them
    async fn disable(&self) -> Result<(), FirewallError>;
    /// Delete every rule
    async fn flush(&self) -> Result<(), FirewallError>;
    fn is_enabled(&self) -> bool;
}

/// Stateless translation of rules into kernel rule-table operations
#[async_trait]
pub trait FirewallAgent: Send + Sync {
    async fn add(&self, rule: &Rule) -> Result<(), FirewallError>;
    async fn delete(&self, rule: &Rule) -> Result<(), FirewallError>;
}
