//! Network blocking, kill switch and IPv6 rules

use super::Combined;
use super::steps::{best_effort, unwind};
use crate::config::Allowlist;
use crate::device::Interface;
use crate::error::{Context, NetworkerError};
use crate::firewall::{Direction, FirewallError, IpProtocol, Rule};
use ipnet::{IpNet, Ipv6Net};
use std::net::Ipv6Addr;
use tracing::info;

/// Blocks all traffic on physical interfaces
pub(super) const BLOCK_RULE: &str = "drop";
/// Lets the control channel (fwmark) through the block rule
pub(super) const API_ALLOWLIST_RULE: &str = "api_allowlist";

const IPV6_ICMP_ERRORS_RULE: &str = "vpn_allowlist_icmp6_errors";
const IPV6_ICMP_ADDRESS_RULE: &str = "vpn_allowlist_icmp6_address";
const IPV6_ICMP_MULTICAST_RULE: &str = "vpn_allowlist_icmp6_multicast";
const IPV6_DHCP_IN_RULE: &str = "vpn_allowlist_dhcp6_in";
const IPV6_DHCP_OUT_RULE: &str = "vpn_allowlist_dhcp6_out";

const IPV6_RULES: [&str; 5] = [
    IPV6_ICMP_ERRORS_RULE,
    IPV6_ICMP_ADDRESS_RULE,
    IPV6_ICMP_MULTICAST_RULE,
    IPV6_DHCP_IN_RULE,
    IPV6_DHCP_OUT_RULE,
];

const LINK_LOCAL_V6: IpNet = IpNet::V6(Ipv6Net::new_assert(
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0),
    10,
));

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// ICMPv6 and DHCPv6 exceptions IPv6 needs to keep working (RFC 4890)
fn ipv6_exception_rules(interfaces: &[Interface]) -> Vec<Rule> {
    let icmp = |name: &str, types: Vec<u8>| Rule {
        interfaces: interfaces.to_vec(),
        protocols: vec![IpProtocol::Ipv6Icmp],
        direction: Direction::TwoWay,
        allow: true,
        ipv6_only: true,
        icmpv6_types: types,
        physical: true,
        ..Rule::named(name)
    };
    let dhcp = |name: &str, port: u16, direction: Direction| Rule {
        interfaces: interfaces.to_vec(),
        local_networks: vec![LINK_LOCAL_V6],
        protocols: vec![IpProtocol::Udp],
        ports: vec![port],
        ports_direction: crate::firewall::PortsDirection::Destination,
        direction,
        allow: true,
        ipv6_only: true,
        physical: true,
        ..Rule::named(name)
    };

    vec![
        icmp(IPV6_ICMP_ERRORS_RULE, vec![1, 2, 3, 4, 128, 129]),
        Rule {
            hop_limit: Some(255),
            ..icmp(
                IPV6_ICMP_ADDRESS_RULE,
                vec![133, 134, 135, 136, 141, 142, 148, 149],
            )
        },
        Rule {
            local_networks: vec![LINK_LOCAL_V6],
            ..icmp(
                IPV6_ICMP_MULTICAST_RULE,
                vec![130, 131, 132, 143, 151, 152, 153],
            )
        },
        dhcp(IPV6_DHCP_IN_RULE, 546, Direction::Inbound),
        dhcp(IPV6_DHCP_OUT_RULE, 547, Direction::Outbound),
    ]
}

impl Combined {
    /// Block all traffic, then re-open the control channel and the allowlist
    pub(super) async fn set_network(&mut self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        let interfaces = self.devices.list().await.context("listing devices")?;

        match self
            .firewall
            .add(vec![Rule {
                interfaces: interfaces.clone(),
                direction: Direction::TwoWay,
                allow: false,
                physical: true,
                ..Rule::named(BLOCK_RULE)
            }])
            .await
        {
            Ok(()) | Err(FirewallError::RuleAlreadyExists(_)) => {}
            Err(e) => return Err(e).context("blocking traffic"),
        }

        if let Err(e) = self.open_network(allowlist, &interfaces).await {
            unwind("removing allowlist rules", self.unset_allowlist()).await;
            unwind(
                "removing block rules",
                self.firewall
                    .delete(&names(&[API_ALLOWLIST_RULE, BLOCK_RULE])),
            )
            .await;
            return Err(e);
        }

        self.state.network_set = true;
        best_effort(
            "resetting exit node allowlist",
            self.exit_node
                .set_allowlist(&self.effective_allowlist(), self.lan_available()),
        )
        .await;
        info!("network rules set");
        Ok(())
    }

    async fn open_network(
        &mut self,
        allowlist: Allowlist,
        interfaces: &[Interface],
    ) -> Result<(), NetworkerError> {
        self.firewall
            .add(vec![Rule {
                interfaces: interfaces.to_vec(),
                direction: Direction::TwoWay,
                marks: vec![self.config.fwmark],
                allow: true,
                physical: true,
                ..Rule::named(API_ALLOWLIST_RULE)
            }])
            .await
            .context("allowing control channel")?;

        self.set_allowlist(allowlist).await?;

        if self.state.ipv6_enabled && !self.state.v6_traffic_allowed {
            self.allow_ipv6_traffic(interfaces).await?;
        }
        Ok(())
    }

    /// Remove the block rule and everything opened in it
    pub(super) async fn unset_network(&mut self) -> Result<(), NetworkerError> {
        self.firewall
            .delete(&names(&[API_ALLOWLIST_RULE]))
            .await
            .context("removing control channel rule")?;
        self.firewall
            .delete(&names(&[BLOCK_RULE]))
            .await
            .context("unblocking traffic")?;
        self.unset_allowlist().await?;
        if self.state.v6_traffic_allowed {
            self.stop_allowed_ipv6_traffic().await?;
        }

        self.state.network_set = false;
        // LAN is always available without network rules
        best_effort(
            "resetting exit node allowlist",
            self.exit_node
                .set_allowlist(&self.effective_allowlist(), true),
        )
        .await;
        info!("network rules removed");
        Ok(())
    }

    pub(super) async fn set_kill_switch(&mut self, allowlist: Allowlist) -> Result<(), NetworkerError> {
        if !self.state.network_set {
            self.set_network(allowlist).await?;
        }
        self.state.kill_switch_set = true;
        info!("kill switch set");
        Ok(())
    }

    /// Network rules stay while the VPN still needs them
    pub(super) async fn unset_kill_switch(&mut self) -> Result<(), NetworkerError> {
        if !self.state.vpn_set && self.state.network_set {
            self.unset_network().await?;
        }
        if self.state.kill_switch_set {
            info!("kill switch unset");
        }
        self.state.kill_switch_set = false;
        Ok(())
    }

    async fn allow_ipv6_traffic(&mut self, interfaces: &[Interface]) -> Result<(), NetworkerError> {
        self.firewall
            .add(ipv6_exception_rules(interfaces))
            .await
            .context("allowing ipv6 traffic")?;
        self.state.v6_traffic_allowed = true;
        Ok(())
    }

    pub(super) async fn stop_allowed_ipv6_traffic(&mut self) -> Result<(), NetworkerError> {
        self.firewall
            .delete(&names(&IPV6_RULES))
            .await
            .context("removing ipv6 exception rules")?;
        self.state.v6_traffic_allowed = false;
        Ok(())
    }

    pub(super) async fn permit_ipv6(&mut self) -> Result<(), NetworkerError> {
        self.state.ipv6_enabled = true;
        self.ipv6.unblock().await.context("unblocking ipv6")?;
        if self.state.network_set && !self.state.v6_traffic_allowed {
            let interfaces = self.devices.list().await.context("listing devices")?;
            self.allow_ipv6_traffic(&interfaces).await?;
        }
        Ok(())
    }

    pub(super) async fn deny_ipv6(&mut self) -> Result<(), NetworkerError> {
        self.state.ipv6_enabled = false;
        if self.state.v6_traffic_allowed {
            self.stop_allowed_ipv6_traffic().await?;
        }
        if !self.state.network_set {
            return Ok(());
        }
        self.ipv6.block().await.context("blocking ipv6")
    }

    pub(super) async fn disable_ipv6_if_needed(&mut self) -> Result<(), NetworkerError> {
        if self.state.ipv6_enabled {
            return Ok(());
        }
        self.deny_ipv6().await
    }

    pub(super) async fn enable_firewall(&self) -> Result<(), NetworkerError> {
        self.firewall.enable().await.context("enabling firewall")
    }

    pub(super) async fn disable_firewall(&self) -> Result<(), NetworkerError> {
        self.firewall.disable().await.context("disabling firewall")
    }

    pub(super) async fn unset_firewall(&mut self) -> Result<(), NetworkerError> {
        if self.state.kill_switch_set {
            return Ok(());
        }
        self.firewall.flush().await.context("flushing firewall")?;
        self.state.network_set = false;
        self.state.dns_denied = false;
        self.state.v6_traffic_allowed = false;
        self.state.rules.clear();
        Ok(())
    }

    /// Routing toggles are advisory, failures are only logged
    pub(super) async fn enable_routing(&self) {
        best_effort("enabling policy routing", self.policy_router.enable()).await;
        let table_id = self.policy_router.table_id();
        best_effort(
            "enabling allowlist routes",
            self.allowlist_router.enable(table_id),
        )
        .await;
        best_effort("enabling default route", self.router.enable(table_id)).await;
        best_effort("enabling peer routes", self.peer_router.enable(table_id)).await;
    }

    pub(super) async fn disable_routing(&self) {
        best_effort("disabling allowlist routes", self.allowlist_router.disable()).await;
        best_effort("disabling default route", self.router.disable()).await;
        best_effort("disabling peer routes", self.peer_router.disable()).await;
        best_effort("disabling policy routing", self.policy_router.disable()).await;
    }
}
