//! Networker Errors

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::dns::DnsError;
use crate::exitnode::ExitNodeError;
use crate::firewall::FirewallError;
use crate::ipv6::Ipv6Error;
use crate::keys::KeyError;
use crate::mesh::MeshError;
use crate::routes::{GatewayError, RouteError};
use crate::tunnel::TunnelError;

/// Errors returned by [`Networker`](crate::Networker)
#[derive(Debug, thiserror::Error)]
pub enum NetworkerError {
    #[error("No VPN implementation configured")]
    NilVpn,

    #[error("VPN is already started")]
    AlreadyStarted,

    #[error("Mesh is already active")]
    MeshAlreadyActive,

    #[error("Mesh is not active")]
    MeshNotActive,

    #[error("Mesh peer is not routable")]
    MeshPeerNotRoutable,

    #[error("Mesh peer not found")]
    MeshPeerNotFound,

    #[error("VPN tunnel was closed by the mesh engine")]
    TunnelClosed,

    #[error("Rule does not exist: {0}")]
    NoSuchRule(String),

    #[error("Rule already exists: {0}")]
    RuleAlreadyExists(String),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Ipv6(#[from] Ipv6Error),

    #[error(transparent)]
    ExitNode(#[from] ExitNodeError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<NetworkerError>,
    },
}

impl NetworkerError {
    /// Innermost error below any context layers
    pub fn root(&self) -> &NetworkerError {
        let mut current = self;
        while let NetworkerError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_nil_vpn(&self) -> bool {
        matches!(self.root(), NetworkerError::NilVpn)
    }

    pub fn is_mesh_not_active(&self) -> bool {
        matches!(self.root(), NetworkerError::MeshNotActive)
    }

    pub fn is_tunnel_closed(&self) -> bool {
        matches!(self.root(), NetworkerError::TunnelClosed)
    }

    pub fn is_no_such_rule(&self) -> bool {
        matches!(self.root(), NetworkerError::NoSuchRule(_))
    }

    /// Rule name collision, raised here or by the firewall
    pub fn is_rule_already_exists(&self) -> bool {
        matches!(
            self.root(),
            NetworkerError::RuleAlreadyExists(_)
                | NetworkerError::Firewall(FirewallError::RuleAlreadyExists(_))
        )
    }

    /// Another route to the same destination is already installed
    pub fn is_route_conflict(&self) -> bool {
        matches!(
            self.root(),
            NetworkerError::Route(RouteError::RouteToOtherDestinationExists(_))
        )
    }
}

/// Attach a short description of the failed step
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T, NetworkerError>;
}

impl<T, E> Context<T> for Result<T, E>
where
    E: Into<NetworkerError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, NetworkerError> {
        self.map_err(|e| NetworkerError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }
}
