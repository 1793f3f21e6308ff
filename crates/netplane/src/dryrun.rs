//! Dry-Run Collaborators
//!
//! In-memory implementations of every collaborator trait. They record the
//! effect each call would have on the system instead of performing it,
//! and every one of them can be told to fail. The CLI simulator runs
//! scenarios on top of them and the test suite injects failures through
//! them.

use crate::config::{Allowlist, Credentials, NetworkerConfig, ServerData, Technology};
use crate::device::{DeviceError, DeviceLister, Interface};
use crate::dns::{DnsError, DnsSetter, Host, HostnameSetter};
use crate::exitnode::{ExitNode, ExitNodeError};
use crate::firewall::{FirewallAgent, FirewallError, FirewallManager, Rule};
use crate::ipv6::{Ipv6Blocker, Ipv6Error};
use crate::keys::{PrivateKey, PublicKey};
use crate::mesh::{Mesh, MeshError, MeshPeer, MeshTopology, PeerStatus};
use crate::networker::{Networker, NetworkerDeps};
use crate::routes::{
    GatewayError, GatewayRetriever, PolicyRouting, Route, RouteAgent, RouteError, Router,
};
use crate::tunnel::{TransferRates, TunnelError, TunnelHandle, Vpn};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Routing table used by [`DryRunPolicyRouting`]
pub const DRY_RUN_TABLE_ID: u32 = 205;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records rules as if they were compiled into the packet filter
#[derive(Default)]
pub struct DryRunFirewallAgent {
    applied: Mutex<Vec<Rule>>,
    fail_on: Mutex<Option<String>>,
    fail_delete_on: Mutex<Option<String>>,
}

impl DryRunFirewallAgent {
    /// Names of the rules currently in effect, in order
    pub fn applied(&self) -> Vec<String> {
        guard(&self.applied).iter().map(|r| r.name.clone()).collect()
    }

    /// A rule currently in effect
    pub fn rule(&self, name: &str) -> Option<Rule> {
        guard(&self.applied).iter().find(|r| r.name == name).cloned()
    }

    /// Make adding the named rule fail
    pub fn fail_on(&self, name: &str) {
        *guard(&self.fail_on) = Some(name.to_string());
    }

    /// Make deleting the named rule fail
    pub fn fail_delete_on(&self, name: &str) {
        *guard(&self.fail_delete_on) = Some(name.to_string());
    }

    pub fn clear_failure(&self) {
        *guard(&self.fail_on) = None;
        *guard(&self.fail_delete_on) = None;
    }
}

#[async_trait]
impl FirewallAgent for DryRunFirewallAgent {
    async fn add(&self, rule: &Rule) -> Result<(), FirewallError> {
        if guard(&self.fail_on).as_deref() == Some(rule.name.as_str()) {
            return Err(FirewallError::Agent(format!("rejected rule {}", rule.name)));
        }
        trace!(rule = %rule.name, "dry-run firewall add");
        guard(&self.applied).push(rule.clone());
        Ok(())
    }

    async fn delete(&self, rule: &Rule) -> Result<(), FirewallError> {
        if guard(&self.fail_delete_on).as_deref() == Some(rule.name.as_str()) {
            return Err(FirewallError::Agent(format!("rule {} is busy", rule.name)));
        }
        trace!(rule = %rule.name, "dry-run firewall delete");
        guard(&self.applied).retain(|r| r.name != rule.name);
        Ok(())
    }
}

/// Records routes as if they were written to the kernel
#[derive(Default)]
pub struct DryRunRouteAgent {
    routes: Mutex<Vec<Route>>,
    /// Routes installed by someone else, never flushed
    foreign: Mutex<Vec<Route>>,
    failing: AtomicBool,
}

impl DryRunRouteAgent {
    /// Routes added through this agent
    pub fn routes(&self) -> Vec<Route> {
        guard(&self.routes).clone()
    }

    /// Pretend another program installed this route
    pub fn add_foreign_route(&self, route: Route) {
        guard(&self.foreign).push(route);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RouteAgent for DryRunRouteAgent {
    async fn add(&self, route: &Route) -> Result<(), RouteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RouteError::Agent(format!("cannot add {}", route)));
        }
        let conflicts = |existing: &Route| {
            existing.subnet == route.subnet
                && existing.table_id == route.table_id
                && (existing.gateway != route.gateway || existing.device != route.device)
        };
        if guard(&self.foreign).iter().any(conflicts) || guard(&self.routes).iter().any(conflicts) {
            return Err(RouteError::RouteToOtherDestinationExists(route.subnet));
        }
        let mut routes = guard(&self.routes);
        if !routes.contains(route) {
            routes.push(route.clone());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), RouteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RouteError::Agent("cannot flush".to_string()));
        }
        guard(&self.routes).clear();
        Ok(())
    }
}

/// Policy routing binding: which device the table redirect belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyBinding {
    pub device: Interface,
    pub is_ipv6: bool,
    pub enable_local: bool,
    pub lan_enabled: bool,
}

/// Records the ip-rule redirect
pub struct DryRunPolicyRouting {
    table_id: u32,
    binding: Mutex<Option<PolicyBinding>>,
    enabled: AtomicBool,
    failing: AtomicBool,
}

impl Default for DryRunPolicyRouting {
    fn default() -> Self {
        Self {
            table_id: DRY_RUN_TABLE_ID,
            binding: Mutex::new(None),
            enabled: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }
}

impl DryRunPolicyRouting {
    pub fn binding(&self) -> Option<PolicyBinding> {
        guard(&self.binding).clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyRouting for DryRunPolicyRouting {
    async fn setup_routing_rules(
        &self,
        device: &Interface,
        is_ipv6: bool,
        enable_local: bool,
        lan_enabled: bool,
    ) -> Result<(), RouteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RouteError::Policy(format!("cannot bind table to {}", device.name)));
        }
        *guard(&self.binding) = Some(PolicyBinding {
            device: device.clone(),
            is_ipv6,
            enable_local,
            lan_enabled,
        });
        Ok(())
    }

    async fn cleanup_routing(&self) -> Result<(), RouteError> {
        *guard(&self.binding) = None;
        Ok(())
    }

    fn table_id(&self) -> u32 {
        self.table_id
    }

    async fn enable(&self) -> Result<(), RouteError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<(), RouteError> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Records per-device resolvers
#[derive(Default)]
pub struct DryRunDns {
    nameservers: Mutex<BTreeMap<String, Vec<String>>>,
    failing: AtomicBool,
}

impl DryRunDns {
    /// Resolvers configured on a device
    pub fn nameservers(&self, device: &str) -> Option<Vec<String>> {
        guard(&self.nameservers).get(device).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, Vec<String>> {
        guard(&self.nameservers).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsSetter for DryRunDns {
    async fn set(&self, device: &str, nameservers: &[String]) -> Result<(), DnsError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DnsError::Set {
                device: device.to_string(),
                reason: "resolver unavailable".to_string(),
            });
        }
        guard(&self.nameservers).insert(device.to_string(), nameservers.to_vec());
        Ok(())
    }

    async fn unset(&self, device: &str) -> Result<(), DnsError> {
        guard(&self.nameservers).remove(device);
        Ok(())
    }
}

/// Records published host records
#[derive(Default)]
pub struct DryRunHosts {
    hosts: Mutex<Vec<Host>>,
    failing: AtomicBool,
    fail_unset: AtomicBool,
}

impl DryRunHosts {
    pub fn hosts(&self) -> Vec<Host> {
        guard(&self.hosts).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make removing host records fail
    pub fn set_fail_unset(&self, failing: bool) {
        self.fail_unset.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostnameSetter for DryRunHosts {
    async fn set_hosts(&self, hosts: Vec<Host>) -> Result<(), DnsError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DnsError::HostsFile("hosts file is read-only".to_string()));
        }
        *guard(&self.hosts) = hosts;
        Ok(())
    }

    async fn unset_hosts(&self) -> Result<(), DnsError> {
        if self.fail_unset.load(Ordering::SeqCst) {
            return Err(DnsError::HostsFile("hosts file is locked".to_string()));
        }
        guard(&self.hosts).clear();
        Ok(())
    }
}

/// Records the global IPv6 switch
#[derive(Default)]
pub struct DryRunIpv6 {
    blocked: AtomicBool,
}

impl DryRunIpv6 {
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ipv6Blocker for DryRunIpv6 {
    async fn block(&self) -> Result<(), Ipv6Error> {
        self.blocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unblock(&self) -> Result<(), Ipv6Error> {
        self.blocked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Exit node state as last configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitNodeState {
    pub enabled: bool,
    /// LAN availability from the most recent reset
    pub lan_available: Option<bool>,
    /// Peers allowed to route through this machine
    pub routed_peers: Vec<PublicKey>,
}

/// Records exit node configuration
#[derive(Default)]
pub struct DryRunExitNode {
    state: Mutex<ExitNodeState>,
    failing: AtomicBool,
    fail_disable: AtomicBool,
}

impl DryRunExitNode {
    pub fn state(&self) -> ExitNodeState {
        guard(&self.state).clone()
    }

    pub fn lan_available(&self) -> Option<bool> {
        guard(&self.state).lan_available
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make disabling forwarding fail
    pub fn set_fail_disable(&self, failing: bool) {
        self.fail_disable.store(failing, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), ExitNodeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExitNodeError::Reset(format!("{what} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl ExitNode for DryRunExitNode {
    async fn enable(&self) -> Result<(), ExitNodeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExitNodeError::Enable("forwarding unavailable".to_string()));
        }
        guard(&self.state).enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<(), ExitNodeError> {
        if self.fail_disable.load(Ordering::SeqCst) {
            return Err(ExitNodeError::Disable("forwarding rules busy".to_string()));
        }
        let mut state = guard(&self.state);
        state.enabled = false;
        state.routed_peers.clear();
        Ok(())
    }

    async fn reset_peers(
        &self,
        peers: &[MeshPeer],
        lan_available: bool,
    ) -> Result<(), ExitNodeError> {
        self.check("peer reset")?;
        let mut state = guard(&self.state);
        state.lan_available = Some(lan_available);
        state.routed_peers = peers
            .iter()
            .filter(|peer| peer.allows_routing)
            .map(|peer| peer.public_key)
            .collect();
        Ok(())
    }

    async fn set_allowlist(
        &self,
        _allowlist: &Allowlist,
        lan_available: bool,
    ) -> Result<(), ExitNodeError> {
        self.check("allowlist reset")?;
        guard(&self.state).lan_available = Some(lan_available);
        Ok(())
    }
}

/// A tunnel device that only exists in memory
pub struct DryRunTunnel {
    interface: Interface,
    ips: Vec<IpAddr>,
    rates: Mutex<TransferRates>,
}

impl DryRunTunnel {
    /// Create a new tunnel device
    pub fn new(interface: Interface, ips: Vec<IpAddr>) -> Self {
        Self {
            interface,
            ips,
            rates: Mutex::new(TransferRates::default()),
        }
    }

    /// Pretend traffic went through the device
    pub fn record_traffic(&self, rx: u64, tx: u64) {
        let mut rates = guard(&self.rates);
        rates.rx += rx;
        rates.tx += tx;
    }
}

impl TunnelHandle for DryRunTunnel {
    fn interface(&self) -> Interface {
        self.interface.clone()
    }

    fn ips(&self) -> Vec<IpAddr> {
        self.ips.clone()
    }

    fn transfer_rates(&self) -> Result<TransferRates, TunnelError> {
        Ok(*guard(&self.rates))
    }
}

/// A VPN that brings up an in-memory tunnel
pub struct DryRunVpn {
    interface: Interface,
    address: IpAddr,
    technology: Technology,
    tun: Mutex<Option<Arc<DryRunTunnel>>>,
    active: AtomicBool,
    fail_start: AtomicBool,
    last_server: Mutex<Option<ServerData>>,
    starts: AtomicUsize,
}

impl DryRunVpn {
    /// Create a new VPN whose tunnel appears as `interface`
    pub fn new(interface: Interface, technology: Technology) -> Self {
        Self {
            interface,
            address: IpAddr::V4(Ipv4Addr::new(10, 5, 0, 2)),
            technology,
            tun: Mutex::new(None),
            active: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            last_server: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    /// WireGuard-style VPN on `nordlynx`
    pub fn wireguard() -> Self {
        Self::new(Interface::new("nordlynx", 10), Technology::WireGuard)
    }

    /// OpenVPN-style VPN on `tun0`
    pub fn openvpn() -> Self {
        Self::new(Interface::new("tun0", 11), Technology::OpenVpn)
    }

    pub fn set_fail_start(&self, failing: bool) {
        self.fail_start.store(failing, Ordering::SeqCst);
    }

    /// Server of the most recent successful start
    pub fn last_server(&self) -> Option<ServerData> {
        guard(&self.last_server).clone()
    }

    /// Number of successful starts
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// The live tunnel, for traffic simulation
    pub fn tunnel(&self) -> Option<Arc<DryRunTunnel>> {
        guard(&self.tun).clone()
    }
}

#[async_trait]
impl Vpn for DryRunVpn {
    async fn start(&self, _creds: &Credentials, server: &ServerData) -> Result<(), TunnelError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TunnelError::Start {
                server: server.ip.to_string(),
                reason: "handshake timed out".to_string(),
            });
        }
        *guard(&self.tun) = Some(Arc::new(DryRunTunnel::new(
            self.interface.clone(),
            vec![self.address],
        )));
        *guard(&self.last_server) = Some(server.clone());
        self.active.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        *guard(&self.tun) = None;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn tun(&self) -> Option<Arc<dyn TunnelHandle>> {
        guard(&self.tun)
            .clone()
            .map(|tun| tun as Arc<dyn TunnelHandle>)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn technology(&self) -> Technology {
        self.technology
    }
}

/// A mesh engine that keeps the applied topology in memory
pub struct DryRunMesh {
    interface: Interface,
    tun: Mutex<Option<Arc<DryRunTunnel>>>,
    topology: Mutex<Option<MeshTopology>>,
    identity: Mutex<Option<PublicKey>>,
    fail_enable: AtomicBool,
    fail_refresh: AtomicBool,
}

impl Default for DryRunMesh {
    fn default() -> Self {
        Self {
            interface: Interface::new("nordmesh", 20),
            tun: Mutex::new(None),
            topology: Mutex::new(None),
            identity: Mutex::new(None),
            fail_enable: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
        }
    }
}

impl DryRunMesh {
    pub fn interface(&self) -> Interface {
        self.interface.clone()
    }

    /// Topology of the most recent refresh
    pub fn topology(&self) -> Option<MeshTopology> {
        guard(&self.topology).clone()
    }

    /// Public key the engine was enabled with
    pub fn identity(&self) -> Option<PublicKey> {
        *guard(&self.identity)
    }

    pub fn set_fail_enable(&self, failing: bool) {
        self.fail_enable.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_refresh(&self, failing: bool) {
        self.fail_refresh.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mesh for DryRunMesh {
    async fn enable(&self, self_addr: IpAddr, private_key: &PrivateKey) -> Result<(), MeshError> {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(MeshError::Enable("engine refused to start".to_string()));
        }
        *guard(&self.tun) = Some(Arc::new(DryRunTunnel::new(
            self.interface.clone(),
            vec![self_addr],
        )));
        *guard(&self.identity) = Some(private_key.public_key());
        Ok(())
    }

    async fn disable(&self) -> Result<(), MeshError> {
        *guard(&self.tun) = None;
        *guard(&self.topology) = None;
        Ok(())
    }

    async fn refresh(&self, topology: &MeshTopology) -> Result<(), MeshError> {
        if guard(&self.tun).is_none() {
            return Err(MeshError::NotRunning);
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(MeshError::Refresh("peer map rejected".to_string()));
        }
        *guard(&self.topology) = Some(topology.clone());
        Ok(())
    }

    fn tun(&self) -> Option<Arc<dyn TunnelHandle>> {
        guard(&self.tun)
            .clone()
            .map(|tun| tun as Arc<dyn TunnelHandle>)
    }

    fn is_active(&self) -> bool {
        guard(&self.tun).is_some()
    }

    async fn status_map(&self) -> Result<HashMap<PublicKey, PeerStatus>, MeshError> {
        if guard(&self.tun).is_none() {
            return Err(MeshError::NotRunning);
        }
        Ok(guard(&self.topology)
            .iter()
            .flat_map(|topology| topology.peers.iter())
            .map(|peer| {
                let status = if peer.address.is_some() {
                    PeerStatus::Connected
                } else {
                    PeerStatus::Disconnected
                };
                (peer.public_key, status)
            })
            .collect())
    }
}

/// Fixed default gateway answers
pub struct DryRunGateway {
    gateway: Option<(IpAddr, Interface)>,
    lookups: AtomicUsize,
}

impl DryRunGateway {
    /// Answer every lookup with `gateway` via `device`
    pub fn new(gateway: IpAddr, device: &str) -> Self {
        Self {
            gateway: Some((gateway, Interface::new(device, 2))),
            lookups: AtomicUsize::new(0),
        }
    }

    /// A machine without a default route
    pub fn none() -> Self {
        Self {
            gateway: None,
            lookups: AtomicUsize::new(0),
        }
    }

    /// Number of lookups performed
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayRetriever for DryRunGateway {
    async fn default_gateway(&self, ipv6: bool) -> Result<(IpAddr, Interface), GatewayError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.gateway
            .clone()
            .ok_or(GatewayError::NoDefaultGateway { ipv6 })
    }
}

/// Fixed list of physical interfaces
pub struct DryRunDevices {
    interfaces: Vec<Interface>,
    failing: AtomicBool,
}

impl Default for DryRunDevices {
    fn default() -> Self {
        Self {
            interfaces: vec![Interface::new("eth0", 2), Interface::new("wlan0", 3)],
            failing: AtomicBool::new(false),
        }
    }
}

impl DryRunDevices {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceLister for DryRunDevices {
    async fn list(&self) -> Result<Vec<Interface>, DeviceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::Listing("netlink dump interrupted".to_string()));
        }
        Ok(self.interfaces.clone())
    }
}

/// Everything a dry-run [`Networker`] would have done to the system
#[derive(Debug, Clone, Serialize)]
pub struct Effects {
    pub firewall_rules: Vec<String>,
    pub default_routes: Vec<Route>,
    pub allowlist_routes: Vec<Route>,
    pub peer_routes: Vec<Route>,
    pub policy_routing: Option<PolicyBinding>,
    pub nameservers: BTreeMap<String, Vec<String>>,
    pub hosts: Vec<Host>,
    pub ipv6_blocked: bool,
    pub exit_node: ExitNodeState,
}

/// A complete set of dry-run collaborators
pub struct DryRunSystem {
    pub firewall: Arc<DryRunFirewallAgent>,
    pub default_routes: Arc<DryRunRouteAgent>,
    pub allowlist_routes: Arc<DryRunRouteAgent>,
    pub peer_routes: Arc<DryRunRouteAgent>,
    pub policy: Arc<DryRunPolicyRouting>,
    pub dns: Arc<DryRunDns>,
    pub hosts: Arc<DryRunHosts>,
    pub ipv6: Arc<DryRunIpv6>,
    pub exit_node: Arc<DryRunExitNode>,
    pub vpn: Arc<DryRunVpn>,
    pub mesh: Arc<DryRunMesh>,
    pub gateway: Arc<DryRunGateway>,
    pub devices: Arc<DryRunDevices>,
}

impl Default for DryRunSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunSystem {
    /// Create a system with a WireGuard VPN and a LAN gateway
    pub fn new() -> Self {
        Self {
            firewall: Arc::default(),
            default_routes: Arc::default(),
            allowlist_routes: Arc::default(),
            peer_routes: Arc::default(),
            policy: Arc::default(),
            dns: Arc::default(),
            hosts: Arc::default(),
            ipv6: Arc::default(),
            exit_node: Arc::default(),
            vpn: Arc::new(DryRunVpn::wireguard()),
            mesh: Arc::default(),
            gateway: Arc::new(DryRunGateway::new(
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                "eth0",
            )),
            devices: Arc::default(),
        }
    }

    /// Build a networker wired to these collaborators
    pub fn networker(&self, config: NetworkerConfig) -> Networker {
        let deps = NetworkerDeps {
            vpn: Some(self.vpn.clone() as Arc<dyn Vpn>),
            mesh: self.mesh.clone(),
            gateway: self.gateway.clone(),
            firewall: Arc::new(FirewallManager::new(self.firewall.clone(), true)),
            router: Arc::new(Router::new(self.default_routes.clone(), true)),
            allowlist_router: Arc::new(Router::new(self.allowlist_routes.clone(), true)),
            peer_router: Arc::new(Router::new(self.peer_routes.clone(), true)),
            policy_router: self.policy.clone(),
            dns: self.dns.clone(),
            hosts: self.hosts.clone(),
            ipv6: self.ipv6.clone(),
            exit_node: self.exit_node.clone(),
            devices: self.devices.clone(),
        };
        Networker::new(config, deps)
    }

    /// Snapshot of the recorded effects
    pub fn effects(&self) -> Effects {
        Effects {
            firewall_rules: self.firewall.applied(),
            default_routes: self.default_routes.routes(),
            allowlist_routes: self.allowlist_routes.routes(),
            peer_routes: self.peer_routes.routes(),
            policy_routing: self.policy.binding(),
            nameservers: self.dns.all(),
            hosts: self.hosts.hosts(),
            ipv6_blocked: self.ipv6.is_blocked(),
            exit_node: self.exit_node.state(),
        }
    }
}
