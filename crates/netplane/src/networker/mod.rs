//! Connection Orchestrator
//!
//! [`Networker`] sequences the VPN tunnel, the mesh overlay, firewall
//! rules, policy routing and DNS so that the system always ends up in a
//! consistent state, rolling back whatever a failed call already applied.
//!
//! # Locking
//!
//! All state lives in one [`Combined`] value behind a single mutex. Every
//! public method takes the lock for the whole call and runs a lock-free
//! method on [`Combined`]. Private methods never lock and call each other
//! freely.
//!
//! # Usage
//!
//! ```rust,ignore
//! let networker = Networker::new(config, deps);
//! let mut progress = networker.subscribe();
//!
//! networker
//!     .start(creds, server, allowlist, vec!["1.1.1.1".into()], true)
//!     .await?;
//! networker.set_kill_switch(Allowlist::default()).await?;
//! networker.stop().await?;
//! ```

mod allowlist;
mod firewall;
mod mesh;
mod status;
mod steps;
mod vpn;

#[cfg(test)]
mod tests;

pub use status::{ConnectionStatus, NetworkerFlags};

use crate::config::{Allowlist, Credentials, NetworkerConfig, ServerData};
use crate::device::{DeviceLister, Interface};
use crate::dns::{DnsSetter, HostnameSetter, NameServers};
use crate::error::NetworkerError;
use crate::exitnode::ExitNode;
use crate::firewall::FirewallService;
use crate::ipv6::Ipv6Blocker;
use crate::keys::{PrivateKey, PublicKey};
use crate::mesh::{Mesh, MeshPeer, MeshTopology, PeerStatus};
use crate::routes::{GatewayCache, GatewayRetriever, PolicyRouting, RouteService};
use crate::tunnel::{TunnelHandle, Vpn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};

/// Capacity of the progress event channel
const EVENT_CAPACITY: usize = 64;

/// Collaborators of a [`Networker`]
pub struct NetworkerDeps {
    /// Tunnel implementation, `None` until one is configured
    pub vpn: Option<Arc<dyn Vpn>>,
    pub mesh: Arc<dyn Mesh>,
    pub gateway: Arc<dyn GatewayRetriever>,
    pub firewall: Arc<dyn FirewallService>,
    /// Routes for the default route through the tunnel
    pub router: Arc<dyn RouteService>,
    /// Routes for allowlisted subnets
    pub allowlist_router: Arc<dyn RouteService>,
    /// Routes for the mesh subnet
    pub peer_router: Arc<dyn RouteService>,
    pub policy_router: Arc<dyn PolicyRouting>,
    pub dns: Arc<dyn DnsSetter>,
    pub hosts: Arc<dyn HostnameSetter>,
    pub ipv6: Arc<dyn Ipv6Blocker>,
    pub exit_node: Arc<dyn ExitNode>,
    pub devices: Arc<dyn DeviceLister>,
}

/// Orchestrator flags and memory between calls
#[derive(Default)]
struct State {
    network_set: bool,
    kill_switch_set: bool,
    v6_traffic_allowed: bool,
    vpn_set: bool,
    mesh_set: bool,
    dns_denied: bool,
    fileshare_permitted: bool,
    lan_discovery: bool,
    ipv6_enabled: bool,
    /// Route to the remote peer's LAN on a mesh peer connection
    enable_local_traffic: bool,
    /// Dynamically named mesh rules currently installed
    rules: Vec<String>,
    /// Allowlist as configured, without LAN permissions
    allowlist: Allowlist,
    topology: Option<MeshTopology>,
    last_server: ServerData,
    last_creds: Credentials,
    last_nameservers: Vec<String>,
    last_private_key: Option<PrivateKey>,
    started_at: Option<Instant>,
}

/// Lock-free orchestrator core
struct Combined {
    vpn: Option<Arc<dyn Vpn>>,
    /// Technology switch queued while a tunnel was up
    next_vpn: Option<Arc<dyn Vpn>>,
    mesh: Arc<dyn Mesh>,
    gateways: GatewayCache,
    firewall: Arc<dyn FirewallService>,
    router: Arc<dyn RouteService>,
    allowlist_router: Arc<dyn RouteService>,
    peer_router: Arc<dyn RouteService>,
    policy_router: Arc<dyn PolicyRouting>,
    dns: Arc<dyn DnsSetter>,
    hosts: Arc<dyn HostnameSetter>,
    ipv6: Arc<dyn Ipv6Blocker>,
    exit_node: Arc<dyn ExitNode>,
    devices: Arc<dyn DeviceLister>,
    config: NetworkerConfig,
    fallback_nameservers: NameServers,
    events: broadcast::Sender<String>,
    state: State,
}

impl Combined {
    fn is_connected_to_vpn(&self) -> bool {
        self.vpn
            .as_ref()
            .is_some_and(|vpn| vpn.tun().is_some() && vpn.is_active())
    }

    fn vpn_tun(&self) -> Option<Arc<dyn TunnelHandle>> {
        self.vpn.as_ref().and_then(|vpn| vpn.tun())
    }

    fn mesh_interface(&self) -> Option<Interface> {
        self.mesh.tun().map(|tun| tun.interface())
    }

    /// Device policy routing is bound to: the VPN tunnel, else the mesh
    fn routing_device(&self) -> Option<Interface> {
        self.vpn_tun()
            .map(|tun| tun.interface())
            .or_else(|| self.mesh_interface())
    }

    /// Whether routed mesh peers may reach the local network
    fn lan_available(&self) -> bool {
        self.state.lan_discovery || !self.state.network_set
    }
}

/// Connection orchestrator
pub struct Networker {
    inner: Mutex<Combined>,
    events: broadcast::Sender<String>,
}

impl Networker {
    /// Create a new networker
    pub fn new(config: NetworkerConfig, deps: NetworkerDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = State {
            lan_discovery: config.lan_discovery,
            ipv6_enabled: config.ipv6_enabled,
            enable_local_traffic: true,
            ..State::default()
        };
        let combined = Combined {
            vpn: deps.vpn,
            next_vpn: None,
            mesh: deps.mesh,
            gateways: GatewayCache::new(deps.gateway, config.gateway_cache_ttl()),
            firewall: deps.firewall,
            router: deps.router,
            allowlist_router: deps.allowlist_router,
            peer_router: deps.peer_router,
            policy_router: deps.policy_router,
            dns: deps.dns,
            hosts: deps.hosts,
            ipv6: deps.ipv6,
            exit_node: deps.exit_node,
            devices: deps.devices,
            fallback_nameservers: NameServers::new(config.fallback_nameservers.clone()),
            config,
            events: events.clone(),
            state,
        };

        Self {
            inner: Mutex::new(combined),
            events,
        }
    }

    /// Receive human-readable progress messages
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Connect to a VPN server, or switch servers when already connected
    pub async fn start(
        &self,
        creds: Credentials,
        server: ServerData,
        allowlist: Allowlist,
        nameservers: Vec<String>,
        enable_local_traffic: bool,
    ) -> Result<(), NetworkerError> {
        let mut inner = self.inner.lock().await;
        inner.state.enable_local_traffic = enable_local_traffic;
        if inner.is_connected_to_vpn() {
            return inner.restart(creds, server, nameservers).await;
        }
        inner.start(creds, server, allowlist, nameservers).await
    }

    /// Rebuild the tunnel for a new server, keeping firewall state
    pub async fn restart(
        &self,
        creds: Credentials,
        server: ServerData,
        nameservers: Vec<String>,
    ) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .restart(creds, server, nameservers)
            .await
    }

    /// Disconnect. Does nothing when not connected.
    pub async fn stop(&self) -> Result<(), NetworkerError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.vpn_set {
            return Ok(());
        }
        match inner.stop().await {
            Err(e) if e.is_nil_vpn() => Ok(()),
            result => result,
        }
    }

    /// Point the tunnel resolver at new nameservers
    pub async fn set_dns(&self, nameservers: Vec<String>) -> Result<(), NetworkerError> {
        let mut inner = self.inner.lock().await;
        if !inner.is_connected_to_vpn() {
            return Ok(());
        }
        inner.set_dns(&nameservers).await?;
        inner.state.last_nameservers = nameservers;
        Ok(())
    }

    pub async fn unset_dns(&self) -> Result<(), NetworkerError> {
        let inner = self.inner.lock().await;
        if !inner.is_connected_to_vpn() {
            return Ok(());
        }
        inner.unset_dns().await
    }

    /// Make remembered firewall rules take effect
    pub async fn enable_firewall(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.enable_firewall().await
    }

    /// Turn every firewall operation into a no-op
    pub async fn disable_firewall(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.disable_firewall().await
    }

    /// Remove every firewall rule unless the kill switch holds them
    pub async fn unset_firewall(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.unset_firewall().await
    }

    pub async fn enable_routing(&self) {
        self.inner.lock().await.enable_routing().await
    }

    pub async fn disable_routing(&self) {
        self.inner.lock().await.disable_routing().await
    }

    /// Replace the allowlist
    pub async fn set_allowlist(&self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        self.inner.lock().await.replace_allowlist(allowlist).await
    }

    /// Drop every allowlist exception
    pub async fn unset_allowlist(&self) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .replace_allowlist(Allowlist::default())
            .await
    }

    pub async fn set_kill_switch(&self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        self.inner.lock().await.set_kill_switch(allowlist).await
    }

    pub async fn unset_kill_switch(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.unset_kill_switch().await
    }

    pub async fn permit_ipv6(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.permit_ipv6().await
    }

    pub async fn deny_ipv6(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.deny_ipv6().await
    }

    /// Swap the tunnel implementation.
    ///
    /// Applied immediately while no tunnel is up, otherwise queued until
    /// the next stop or restart.
    pub async fn set_vpn(&self, vpn: Arc<dyn Vpn>) {
        self.inner.lock().await.set_vpn(vpn)
    }

    pub async fn set_lan_discovery(&self, enabled: bool) {
        self.inner.lock().await.set_lan_discovery(enabled).await
    }

    /// Bring the mesh overlay up
    pub async fn set_mesh(
        &self,
        topology: MeshTopology,
        self_addr: IpAddr,
        private_key: PrivateKey,
    ) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .set_mesh(topology, self_addr, private_key)
            .await
    }

    /// Tear the mesh overlay down
    pub async fn unset_mesh(&self) -> Result<(), NetworkerError> {
        let mut inner = self.inner.lock().await;
        inner.state.enable_local_traffic = true;
        inner.unset_mesh().await
    }

    /// Apply a new mesh peer list
    pub async fn refresh(&self, topology: MeshTopology) -> Result<(), NetworkerError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.mesh_set {
            return Err(NetworkerError::MeshNotActive);
        }
        inner.refresh(topology).await
    }

    /// Allow inbound connections from one peer address
    pub async fn allow_incoming(
        &self,
        public_key: &PublicKey,
        address: IpAddr,
        lan_allowed: bool,
    ) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .allow_incoming(public_key, address, lan_allowed)
            .await
    }

    /// Remove the inbound allow rule of one peer address
    pub async fn block_incoming(
        &self,
        public_key: &PublicKey,
        address: IpAddr,
    ) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .block_incoming(public_key, address)
            .await
    }

    pub async fn allow_fileshare(
        &self,
        public_key: &PublicKey,
        address: IpAddr,
    ) -> Result<(), NetworkerError> {
        self.inner
            .lock()
            .await
            .allow_fileshare(public_key, address)
            .await
    }

    pub async fn permit_fileshare(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.permit_fileshare().await
    }

    pub async fn forbid_fileshare(&self) -> Result<(), NetworkerError> {
        self.inner.lock().await.forbid_fileshare().await
    }

    /// Re-feed the exit node and re-create one peer's inbound rule
    pub async fn reset_routing(
        &self,
        peer: &MeshPeer,
        peers: &[MeshPeer],
    ) -> Result<(), NetworkerError> {
        self.inner.lock().await.reset_routing(peer, peers).await
    }

    /// React to a network change notification
    pub async fn reconnect(&self, network_up: bool) -> Result<(), NetworkerError> {
        self.inner.lock().await.reconnect(network_up).await
    }

    pub async fn connection_status(&self) -> Result<ConnectionStatus, NetworkerError> {
        self.inner.lock().await.connection_status()
    }

    /// Last server and whether the tunnel is up
    pub async fn connection_parameters(&self) -> (ServerData, bool) {
        let inner = self.inner.lock().await;
        (inner.state.last_server.clone(), inner.is_connected_to_vpn())
    }

    pub async fn last_server_name(&self) -> String {
        self.inner.lock().await.state.last_server.hostname.clone()
    }

    pub async fn status_map(&self) -> Result<HashMap<PublicKey, PeerStatus>, NetworkerError> {
        let inner = self.inner.lock().await;
        Ok(inner.mesh.status_map().await?)
    }

    pub async fn is_vpn_active(&self) -> bool {
        self.inner.lock().await.is_connected_to_vpn()
    }

    pub async fn is_network_set(&self) -> bool {
        self.inner.lock().await.state.network_set
    }

    pub async fn is_mesh_active(&self) -> bool {
        self.inner.lock().await.state.mesh_set
    }

    /// Snapshot of the orchestrator flags
    pub async fn flags(&self) -> NetworkerFlags {
        self.inner.lock().await.flags()
    }
}
