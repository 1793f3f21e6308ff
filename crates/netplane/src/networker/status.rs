//! Connection status queries

use super::Combined;
use crate::config::{Protocol, Technology};
use crate::error::NetworkerError;
use crate::tunnel::{TransferRates, TunnelState};
use serde::Serialize;
use std::net::IpAddr;

/// Derived snapshot of the VPN connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: TunnelState,
    pub technology: Technology,
    pub protocol: Protocol,
    /// Server address
    pub ip: Option<IpAddr>,
    pub name: String,
    pub hostname: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub tunnel_name: String,
    pub transfer: TransferRates,
    pub uptime_secs: Option<u64>,
}

/// Orchestrator flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkerFlags {
    pub network_set: bool,
    pub kill_switch_set: bool,
    pub vpn_set: bool,
    pub mesh_set: bool,
    pub lan_discovery: bool,
    pub ipv6_enabled: bool,
    pub v6_traffic_allowed: bool,
    pub dns_denied: bool,
    pub fileshare_permitted: bool,
}

impl Combined {
    pub(super) fn connection_status(&self) -> Result<ConnectionStatus, NetworkerError> {
        let (Some(vpn), Some(tun)) = (self.vpn.as_ref(), self.vpn_tun()) else {
            return Ok(ConnectionStatus::default());
        };
        if !vpn.is_active() {
            return Ok(ConnectionStatus::default());
        }

        let server = &self.state.last_server;
        Ok(ConnectionStatus {
            state: TunnelState::Connected,
            technology: vpn.technology(),
            protocol: server.protocol,
            ip: Some(server.ip),
            name: server.name.clone(),
            hostname: server.hostname.clone(),
            country: server.country.clone(),
            country_code: server.country_code.clone(),
            city: server.city.clone(),
            tunnel_name: tun.interface().name,
            transfer: tun.transfer_rates()?,
            uptime_secs: self.state.started_at.map(|at| at.elapsed().as_secs()),
        })
    }

    pub(super) fn flags(&self) -> NetworkerFlags {
        NetworkerFlags {
            network_set: self.state.network_set,
            kill_switch_set: self.state.kill_switch_set,
            vpn_set: self.state.vpn_set,
            mesh_set: self.state.mesh_set,
            lan_discovery: self.state.lan_discovery,
            ipv6_enabled: self.state.ipv6_enabled,
            v6_traffic_allowed: self.state.v6_traffic_allowed,
            dns_denied: self.state.dns_denied,
            fileshare_permitted: self.state.fileshare_permitted,
        }
    }
}
