//! VPN lifecycle: start, restart, stop, recovery and network changes

use super::Combined;
use super::steps::{best_effort, unwind};
use crate::config::{Allowlist, Credentials, ServerData};
use crate::device::Interface;
use crate::error::{Context, NetworkerError};
use crate::mesh::DEFAULT_MESH_SUBNET;
use crate::routes::Route;
use crate::tunnel::{TunnelError, Vpn};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const DEFAULT_ROUTE: IpNet = IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0));

impl Combined {
    fn vpn_interface(&self) -> Result<Interface, NetworkerError> {
        self.vpn_tun()
            .map(|tun| tun.interface())
            .ok_or(NetworkerError::Tunnel(TunnelError::DeviceDown))
    }

    /// An unspecified server address means "the last server"
    fn resolve_server(&self, server: ServerData) -> ServerData {
        if server.has_address() {
            server
        } else {
            self.state.last_server.clone()
        }
    }

    /// Cold start. Any failure after the tunnel came up is fully recovered.
    pub(super) async fn start(
        &mut self,
        creds: Credentials,
        server: ServerData,
        allowlist: Allowlist,
        nameservers: Vec<String>,
    ) -> Result<(), NetworkerError> {
        if self.state.vpn_set {
            return Err(NetworkerError::AlreadyStarted);
        }
        let vpn = self.vpn.clone().ok_or(NetworkerError::NilVpn)?;
        let server = self.resolve_server(server);

        if let Err(e) = self
            .bring_up(&vpn, &creds, &server, allowlist, &nameservers)
            .await
        {
            self.failure_recover().await;
            return Err(e);
        }

        info!(server = %server.ip, technology = %vpn.technology(), "vpn started");
        self.state.vpn_set = true;
        self.state.last_server = server;
        self.state.last_creds = creds;
        self.state.last_nameservers = nameservers;
        self.state.started_at = Some(Instant::now());
        Ok(())
    }

    async fn bring_up(
        &mut self,
        vpn: &Arc<dyn Vpn>,
        creds: &Credentials,
        server: &ServerData,
        allowlist: Allowlist,
        nameservers: &[String],
    ) -> Result<(), NetworkerError> {
        self.publish("starting vpn");
        start_tunnel(vpn, creds, server).await?;

        self.publish("setting the routing rules up");
        // mesh keeps its own binding while active
        if !self.state.mesh_set {
            let device = self.vpn_interface()?;
            self.policy_router
                .setup_routing_rules(
                    &device,
                    server.ip.is_ipv6(),
                    self.state.enable_local_traffic,
                    self.state.lan_discovery,
                )
                .await
                .context("setting routing rules")?;
        }

        self.configure_network(allowlist, server, nameservers).await
    }

    async fn configure_network(
        &mut self,
        allowlist: Allowlist,
        server: &ServerData,
        nameservers: &[String],
    ) -> Result<(), NetworkerError> {
        self.publish("starting network configuration");

        if self.state.network_set {
            self.state.allowlist = allowlist;
        } else {
            self.set_network(allowlist).await?;
        }
        self.reset_allowlist().await?;

        self.add_default_route().await?;
        self.configure_dns(server, nameservers).await?;

        if self.state.mesh_set
            && let Some(topology) = self.state.topology.clone()
        {
            self.refresh(topology).await.context("refreshing mesh")?;
        }

        self.disable_ipv6_if_needed().await
    }

    /// Install `0.0.0.0/0` through the tunnel into the policy table
    pub(super) async fn add_default_route(&self) -> Result<(), NetworkerError> {
        let route = Route {
            subnet: DEFAULT_ROUTE,
            gateway: None,
            device: self.vpn_interface()?,
            table_id: self.policy_router.table_id(),
        };
        self.router
            .add(route)
            .await
            .context("adding the default route")
    }

    /// Servers inside the mesh subnet are resolved outside the tunnel
    async fn configure_dns(
        &self,
        server: &ServerData,
        nameservers: &[String],
    ) -> Result<(), NetworkerError> {
        if self.state.mesh_set && DEFAULT_MESH_SUBNET.contains(&server.ip) {
            self.set_dns(&self.fallback_nameservers.get(false)).await
        } else {
            self.set_dns(nameservers).await
        }
    }

    pub(super) async fn set_dns(&self, nameservers: &[String]) -> Result<(), NetworkerError> {
        let device = self.vpn_interface()?;
        self.dns
            .set(&device.name, nameservers)
            .await
            .context("setting dns")
    }

    pub(super) async fn unset_dns(&self) -> Result<(), NetworkerError> {
        let Some(tun) = self.vpn_tun() else {
            return Ok(());
        };
        self.dns
            .unset(&tun.interface().name)
            .await
            .context("unsetting dns")
    }

    /// Same-technology reconnect: only the tunnel and default route are
    /// rebuilt. Without a live tunnel this is a cold start with the stored
    /// allowlist.
    pub(super) async fn restart(
        &mut self,
        creds: Credentials,
        server: ServerData,
        nameservers: Vec<String>,
    ) -> Result<(), NetworkerError> {
        if !self.is_connected_to_vpn() {
            let allowlist = self.state.allowlist.clone();
            return self.start(creds, server, allowlist, nameservers).await;
        }
        let vpn = self.vpn.clone().ok_or(NetworkerError::NilVpn)?;

        match self.rebuild_tunnel(vpn, &creds, server, &nameservers).await {
            Ok(server) => {
                info!(server = %server.ip, "vpn restarted");
                self.state.vpn_set = true;
                self.state.last_server = server;
                self.state.last_creds = creds;
                self.state.last_nameservers = nameservers;
                self.state.started_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.failure_recover().await;
                Err(e)
            }
        }
    }

    async fn rebuild_tunnel(
        &mut self,
        vpn: Arc<dyn Vpn>,
        creds: &Credentials,
        server: ServerData,
        nameservers: &[String],
    ) -> Result<ServerData, NetworkerError> {
        best_effort("removing default route", self.router.flush()).await;
        vpn.stop().await?;

        self.publish("restarting vpn");
        let switched = self.switch_to_next_vpn();
        let vpn = self.vpn.clone().ok_or(NetworkerError::NilVpn)?;
        let server = self.resolve_server(server);
        start_tunnel(&vpn, creds, &server).await?;

        // the new technology brings a new device
        if switched && !self.state.mesh_set {
            let device = self.vpn_interface()?;
            self.policy_router
                .setup_routing_rules(
                    &device,
                    server.ip.is_ipv6(),
                    self.state.enable_local_traffic,
                    self.state.lan_discovery,
                )
                .await
                .context("setting routing rules")?;
        }

        // the tunnel device was recreated
        self.add_default_route().await?;
        self.configure_dns(&server, nameservers).await?;

        if let Err(e) = self.disable_ipv6_if_needed().await {
            error!("failed to disable ipv6: {}", e);
        }
        Ok(server)
    }

    pub(super) async fn stop(&mut self) -> Result<(), NetworkerError> {
        let vpn = self.vpn.clone().ok_or(NetworkerError::NilVpn)?;

        self.publish("stopping network configuration");
        best_effort("unblocking ipv6", self.ipv6.unblock()).await;
        self.unset_dns().await?;

        self.publish("removing route to tunnel");
        if !self.state.mesh_set {
            best_effort("cleaning up routing", self.policy_router.cleanup_routing()).await;
        } else if let Some(device) = self.mesh_interface() {
            self.policy_router
                .setup_routing_rules(&device, false, true, self.state.lan_discovery)
                .await
                .context("binding routing rules to mesh")?;
        }

        self.publish("removing route to the vpn server");
        best_effort("flushing default route", self.router.flush()).await;

        self.publish("stopping vpn");
        vpn.stop().await.context("stopping tunnel")?;

        if !self.state.kill_switch_set {
            self.unset_network().await.context("unsetting network")?;
        }

        self.switch_to_next_vpn();
        self.state.vpn_set = false;
        self.state.started_at = None;
        info!("vpn stopped");
        Ok(())
    }

    /// Undo whatever a failed start or restart left behind. Never fails.
    async fn failure_recover(&mut self) {
        warn!("recovering from failed vpn start");
        if !self.state.mesh_set {
            unwind("cleaning up routing", self.policy_router.cleanup_routing()).await;
        }
        unwind("flushing default route", self.router.flush()).await;
        if let Some(vpn) = self.vpn.clone() {
            unwind("stopping tunnel", vpn.stop()).await;
        }
        if self.state.network_set && !self.state.kill_switch_set {
            unwind("unsetting network", self.unset_network()).await;
        }
        if self.state.v6_traffic_allowed {
            unwind(
                "removing ipv6 exception rules",
                self.stop_allowed_ipv6_traffic(),
            )
            .await;
        }
        self.state.vpn_set = false;
        self.state.started_at = None;
    }

    /// Apply a queued technology switch
    fn switch_to_next_vpn(&mut self) -> bool {
        match self.next_vpn.take() {
            Some(next) => {
                info!(technology = %next.technology(), "switching vpn technology");
                self.vpn = Some(next);
                true
            }
            None => false,
        }
    }

    pub(super) fn set_vpn(&mut self, vpn: Arc<dyn Vpn>) {
        let active = self.vpn.as_ref().is_some_and(|current| current.is_active());
        if active {
            self.next_vpn = Some(vpn);
        } else {
            self.vpn = Some(vpn);
        }
    }

    pub(super) async fn reconnect(&mut self, network_up: bool) -> Result<(), NetworkerError> {
        // interface indices may have changed underneath
        if self.is_connected_to_vpn() && !self.state.ipv6_enabled {
            best_effort("re-blocking ipv6", self.ipv6.block()).await;
        }
        if !network_up {
            return Ok(());
        }
        self.gateways.invalidate();
        self.refresh_vpn().await
    }

    /// Tear down and rebuild mesh and VPN, keeping firewall rules up
    async fn refresh_vpn(&mut self) -> Result<(), NetworkerError> {
        let vpn_started = self.state.vpn_set;
        let mesh_started = self.state.mesh_set;

        if self.state.kill_switch_set {
            // block rules follow the current interfaces
            self.unset_kill_switch()
                .await
                .context("unsetting kill switch")?;
            let allowlist = self.state.allowlist.clone();
            self.set_kill_switch(allowlist)
                .await
                .context("setting kill switch")?;
        }

        if !vpn_started && !mesh_started {
            return Ok(());
        }
        info!(vpn = vpn_started, mesh = mesh_started, "rebuilding tunnels after network change");

        let mut self_addr: Option<IpAddr> = None;
        let mut forced_kill_switch = false;
        let mut vpn_result = Ok(());

        if vpn_started {
            if !self.state.kill_switch_set {
                let allowlist = self.state.allowlist.clone();
                self.set_kill_switch(allowlist)
                    .await
                    .context("forcing kill switch")?;
                forced_kill_switch = true;
            }
            self_addr = self.vpn_tun().and_then(|tun| tun.ips().first().copied());
            vpn_result = self.stop().await.context("stopping vpn");
        }

        let mut mesh_result = Ok(());
        if vpn_result.is_ok() && mesh_started {
            if let Some(ip) = self.mesh.tun().and_then(|tun| tun.ips().first().copied()) {
                self_addr = Some(ip);
            }
            mesh_result = self.rebuild_mesh(self_addr).await;
        }

        if vpn_result.is_ok() && vpn_started {
            let creds = self.state.last_creds.clone();
            let server = self.state.last_server.clone();
            let allowlist = self.state.allowlist.clone();
            let nameservers = self.state.last_nameservers.clone();
            vpn_result = self
                .start(creds, server, allowlist, nameservers)
                .await
                .context("starting vpn");
        }

        if forced_kill_switch {
            if vpn_result.is_err() {
                // block rules stay in place
                self.state.kill_switch_set = false;
            } else {
                vpn_result = self.unset_kill_switch().await;
            }
        }

        if let (Err(vpn_err), Err(mesh_err)) = (&vpn_result, &mesh_result) {
            error!("mesh rebuild also failed: {}", mesh_err);
            warn!("returning vpn error: {}", vpn_err);
        }
        vpn_result.and(mesh_result)
    }
}

/// Bring a tunnel up, stopping it again if that fails
async fn start_tunnel(
    vpn: &Arc<dyn Vpn>,
    creds: &Credentials,
    server: &ServerData,
) -> Result<(), NetworkerError> {
    if let Err(e) = vpn.start(creds, server).await {
        best_effort("stopping failed tunnel", vpn.stop()).await;
        return Err(e.into());
    }
    Ok(())
}
