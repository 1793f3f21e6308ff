//! Allowlist rules, allowlist routes and DNS leak protection

use super::Combined;
use super::steps::best_effort;
use crate::config::{Allowlist, private_subnets};
use crate::error::{Context, NetworkerError};
use crate::firewall::{Direction, IpProtocol, PortsDirection, Rule};
use crate::routes::{GatewayError, Route, RouteError};
use ipnet::{IpNet, Ipv6Net};
use std::net::Ipv6Addr;
use tracing::{debug, error, info, warn};

const ALLOWLIST_SUBNETS_RULE: &str = "allowlist_subnets";
const ALLOWLIST_PORTS_TCP_RULE: &str = "allowlist_ports_tcp";
const ALLOWLIST_PORTS_UDP_RULE: &str = "allowlist_ports_udp";
const DENY_PRIVATE_DNS_RULE: &str = "deny-private-dns";

const DNS_PORT: u16 = 53;

/// IPv6 ranges that never leave the local network
const LOCAL_V6: [IpNet; 2] = [
    IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7)),
    IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10)),
];

/// Private subnets only need a firewall exception, public ones also a route
fn is_private_subnet(subnet: &IpNet) -> bool {
    match subnet {
        IpNet::V4(_) => private_subnets().iter().any(|private| private.contains(subnet)),
        IpNet::V6(_) => LOCAL_V6.iter().any(|local| local.contains(subnet)),
    }
}

impl Combined {
    /// Allowlist with LAN permissions applied when LAN discovery is on
    pub(super) fn effective_allowlist(&self) -> Allowlist {
        if self.state.lan_discovery {
            self.state.allowlist.with_lan_permissions()
        } else {
            self.state.allowlist.clone()
        }
    }

    /// Install firewall exceptions and routes for an allowlist
    pub(super) async fn set_allowlist(&mut self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        let interfaces = self.devices.list().await.context("listing devices")?;
        self.state.allowlist = allowlist;
        let allowlist = self.effective_allowlist();

        let mut rules = Vec::new();
        if !allowlist.subnets.is_empty() {
            rules.push(Rule {
                interfaces: interfaces.clone(),
                remote_networks: allowlist.subnets.iter().copied().collect(),
                direction: Direction::TwoWay,
                allow: true,
                physical: true,
                ..Rule::named(ALLOWLIST_SUBNETS_RULE)
            });
        }
        for (name, protocol, ports) in [
            (ALLOWLIST_PORTS_TCP_RULE, IpProtocol::Tcp, &allowlist.ports.tcp),
            (ALLOWLIST_PORTS_UDP_RULE, IpProtocol::Udp, &allowlist.ports.udp),
        ] {
            if ports.is_empty() {
                continue;
            }
            rules.push(Rule {
                interfaces: interfaces.clone(),
                protocols: vec![protocol],
                ports: ports.iter().copied().collect(),
                direction: Direction::TwoWay,
                allow: true,
                physical: true,
                ..Rule::named(name)
            });
        }
        self.firewall
            .add(rules)
            .await
            .context("adding allowlist rules")?;

        self.add_allowlist_routes(&allowlist).await?;

        self.exit_node
            .set_allowlist(&allowlist, self.lan_available())
            .await
            .context("resetting forwarding allowlist")?;

        // resolvers on the LAN would leak queries outside the tunnel
        if !allowlist.contains_port(DNS_PORT) {
            self.deny_dns().await?;
        }
        Ok(())
    }

    /// Route public allowlisted subnets through the default gateway
    async fn add_allowlist_routes(&self, allowlist: &Allowlist) -> Result<(), NetworkerError> {
        let table_id = self.policy_router.table_id();
        for subnet in allowlist.subnets.iter().filter(|s| !is_private_subnet(s)) {
            let ipv6 = matches!(subnet, IpNet::V6(_));
            let (gateway, device) = match self.gateways.default_gateway(ipv6).await {
                Ok(found) => found,
                Err(GatewayError::NoDefaultGateway { .. }) => {
                    warn!(%subnet, "no default gateway, allowlisted subnet gets a firewall exception only");
                    continue;
                }
                Err(e) => return Err(e).context("looking up default gateway"),
            };

            let route = Route {
                subnet: *subnet,
                gateway: Some(gateway),
                device,
                table_id,
            };
            match self.allowlist_router.add(route).await {
                Ok(()) => {}
                Err(RouteError::RouteToOtherDestinationExists(subnet)) => {
                    warn!(%subnet, "keeping existing route to allowlisted subnet");
                }
                Err(e) => return Err(e).context("adding allowlist route"),
            }
        }
        Ok(())
    }

    pub(super) async fn unset_allowlist(&mut self) -> Result<(), NetworkerError> {
        debug!("unset allowlist");
        best_effort("flushing allowlist routes", self.allowlist_router.flush()).await;

        self.firewall
            .delete(&[
                ALLOWLIST_SUBNETS_RULE.to_string(),
                ALLOWLIST_PORTS_TCP_RULE.to_string(),
                ALLOWLIST_PORTS_UDP_RULE.to_string(),
            ])
            .await
            .context("removing allowlist rules")?;

        self.undeny_dns().await
    }

    /// Delete and re-add allowlist rules, keeping their order after the block rule
    pub(super) async fn reset_allowlist(&mut self) -> Result<(), NetworkerError> {
        debug!("reset allowlist");
        self.unset_allowlist()
            .await
            .context("unsetting allowlist")?;
        let allowlist = self.state.allowlist.clone();
        self.set_allowlist(allowlist)
            .await
            .context("re-setting allowlist")
    }

    /// Public `SetAllowlist`: only touches rules while the network is set
    pub(super) async fn replace_allowlist(&mut self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        if !self.state.network_set {
            self.state.allowlist = allowlist;
            return Ok(());
        }
        self.unset_allowlist().await?;
        self.set_allowlist(allowlist).await?;
        info!("allowlist replaced");
        Ok(())
    }

    async fn deny_dns(&mut self) -> Result<(), NetworkerError> {
        if self.state.dns_denied {
            debug!("private dns already denied");
            return Ok(());
        }
        self.firewall
            .add(vec![Rule {
                protocols: vec![IpProtocol::Udp, IpProtocol::Tcp],
                ports: vec![DNS_PORT],
                ports_direction: PortsDirection::Destination,
                remote_networks: private_subnets(),
                direction: Direction::Outbound,
                allow: false,
                physical: true,
                ..Rule::named(DENY_PRIVATE_DNS_RULE)
            }])
            .await
            .context("adding deny-private-dns rule")?;
        self.state.dns_denied = true;
        Ok(())
    }

    async fn undeny_dns(&mut self) -> Result<(), NetworkerError> {
        if !self.state.dns_denied {
            return Ok(());
        }
        self.firewall
            .delete(&[DENY_PRIVATE_DNS_RULE.to_string()])
            .await
            .context("removing deny-private-dns rule")?;
        self.state.dns_denied = false;
        Ok(())
    }

    /// LAN discovery changes the policy fed to routing and the exit node
    pub(super) async fn set_lan_discovery(&mut self, enabled: bool) {
        self.state.lan_discovery = enabled;

        if self.state.mesh_set || self.state.vpn_set {
            if let Some(device) = self.routing_device() {
                if let Err(e) = self
                    .policy_router
                    .setup_routing_rules(
                        &device,
                        self.state.last_server.ip.is_ipv6(),
                        self.state.enable_local_traffic,
                        enabled,
                    )
                    .await
                {
                    error!("failed to set routing rules up after changing lan discovery: {}", e);
                }
            }
        }

        if let Err(e) = self
            .exit_node
            .set_allowlist(&self.effective_allowlist(), self.lan_available())
            .await
        {
            error!("failed to reset forwarding rules after changing lan discovery: {}", e);
        }
    }
}
