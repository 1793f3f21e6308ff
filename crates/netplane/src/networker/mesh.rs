//! Mesh overlay: bring-up, teardown, peer rules and host records

use super::Combined;
use super::steps::{best_effort, unwind};
use crate::config::private_subnets;
use crate::dns::Host;
use crate::error::{Context, NetworkerError};
use crate::firewall::{ConnectionState, ConnectionStates, Direction, IpProtocol, PortsDirection, Rule};
use crate::keys::{PrivateKey, PublicKey};
use crate::mesh::{DEFAULT_MESH_SUBNET, MeshError, MeshPeer, MeshTopology};
use crate::routes::Route;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, info, warn};

const DEFAULT_MESH_BLOCK_RULE: &str = "default-mesh-block";
const DEFAULT_MESH_ALLOW_ESTABLISHED_RULE: &str = "default-mesh-allow-established";
const ALLOW_INCOMING_RULE: &str = "-allow-rule-";
const BLOCK_LAN_RULE: &str = "-block-lan-rule-";
const ALLOW_FILESHARE_RULE: &str = "-allow-fileshare-rule-";

/// Comment carried by every mesh rule
const MESH_RULE_COMMENT: &str = "netplane-mesh";

/// Port the fileshare daemon listens on
const FILESHARE_PORT: u16 = 49111;

fn rule_name(public_key: &PublicKey, kind: &str, address: IpAddr) -> String {
    format!("{public_key}{kind}{address}")
}

fn host_net(address: IpAddr) -> IpNet {
    IpNet::from(address)
}

impl Combined {
    pub(super) async fn set_mesh(
        &mut self,
        topology: MeshTopology,
        self_addr: IpAddr,
        private_key: PrivateKey,
    ) -> Result<(), NetworkerError> {
        if self.state.mesh_set {
            return Err(NetworkerError::MeshAlreadyActive);
        }

        // the engine may recreate tunnel devices
        if self.state.vpn_set {
            best_effort("flushing default route", self.router.flush()).await;
        }

        if let Err(e) = self.mesh.enable(self_addr, &private_key).await {
            if self.state.vpn_set && !self.mesh.is_active() {
                warn!("mesh engine took the vpn tunnel down: {}", e);
                self.state.vpn_set = false;
                return Err(NetworkerError::TunnelClosed);
            }
            return Err(e).context("enabling mesh");
        }

        let mut routing_set = false;
        if let Err(e) = self.bring_up_mesh(topology, &mut routing_set).await {
            if routing_set {
                unwind("cleaning up routing", self.policy_router.cleanup_routing()).await;
            }
            unwind("removing mesh block rules", self.default_mesh_unblock()).await;
            unwind("unsetting mesh hosts", self.hosts.unset_hosts()).await;
            unwind("disabling exit node", self.exit_node.disable()).await;
            unwind("flushing peer routes", self.peer_router.flush()).await;
            unwind("disabling mesh", self.mesh.disable()).await;
            return Err(e);
        }

        self.state.mesh_set = true;
        self.state.last_private_key = Some(private_key);
        info!(address = %self_addr, "mesh enabled");
        Ok(())
    }

    async fn bring_up_mesh(
        &mut self,
        topology: MeshTopology,
        routing_set: &mut bool,
    ) -> Result<(), NetworkerError> {
        let device = self
            .mesh_interface()
            .ok_or(NetworkerError::Mesh(MeshError::NotRunning))?;

        if self.state.vpn_set {
            self.add_default_route().await?;
        } else {
            self.policy_router
                .setup_routing_rules(
                    &device,
                    false,
                    self.state.enable_local_traffic,
                    self.state.lan_discovery,
                )
                .await
                .context("setting routing rules")?;
            *routing_set = true;
        }

        self.publish("adding mesh route");
        self.peer_router
            .add(Route {
                subnet: DEFAULT_MESH_SUBNET,
                gateway: None,
                device,
                table_id: self.policy_router.table_id(),
            })
            .await
            .context("adding the mesh route")?;

        self.refresh(topology).await
    }

    pub(super) async fn unset_mesh(&mut self) -> Result<(), NetworkerError> {
        if !self.state.mesh_set {
            return Err(NetworkerError::MeshNotActive);
        }

        self.hosts.unset_hosts().await.context("unsetting hosts")?;
        self.default_mesh_unblock()
            .await
            .context("unblocking the peer subnet")?;
        self.exit_node
            .disable()
            .await
            .context("disabling exit node")?;

        if !self.state.vpn_set {
            self.policy_router
                .cleanup_routing()
                .await
                .context("cleaning up routing")?;
        }

        best_effort("clearing peer routes", self.peer_router.flush()).await;
        if self.state.vpn_set {
            best_effort("flushing default route", self.router.flush()).await;
        }

        self.mesh.disable().await.context("disabling the mesh")?;

        if self.state.vpn_set {
            self.add_default_route().await?;
            if let Some(tun) = self.vpn_tun() {
                self.policy_router
                    .setup_routing_rules(
                        &tun.interface(),
                        self.state.last_server.ip.is_ipv6(),
                        self.state.enable_local_traffic,
                        self.state.lan_discovery,
                    )
                    .await
                    .context("binding routing rules to vpn")?;
            }
        }

        self.state.mesh_set = false;
        info!("mesh disabled");
        Ok(())
    }

    /// Apply a topology: rules, exit node and host records follow the peer list
    pub(super) async fn refresh(&mut self, topology: MeshTopology) -> Result<(), NetworkerError> {
        debug!(peers = topology.peers.len(), "refreshing mesh");
        best_effort("removing mesh rules", self.default_mesh_unblock()).await;
        best_effort("unsetting mesh hosts", self.hosts.unset_hosts()).await;
        best_effort("disabling exit node", self.exit_node.disable()).await;

        self.exit_node
            .enable()
            .await
            .context("enabling exit node")?;
        self.mesh
            .refresh(&topology)
            .await
            .context("refreshing mesh")?;
        self.state.topology = Some(topology.clone());

        let machine = &topology.machine;
        self.default_mesh_block(machine.address)
            .await
            .context("adding default block rule")?;
        self.allow_incoming(&machine.public_key, machine.address, true)
            .await
            .context("allowing to reach self via mesh")?;

        for peer in &topology.peers {
            let Some(address) = peer.address else {
                continue;
            };
            if peer.allows_inbound {
                self.allow_incoming(&peer.public_key, address, peer.lan_allowed())
                    .await
                    .context("allowing inbound traffic for peer")?;
            }
            if peer.allows_fileshare {
                self.allow_fileshare(&peer.public_key, address)
                    .await
                    .context("allowing fileshare for peer")?;
            }
        }

        self.exit_node
            .reset_peers(&topology.peers, self.lan_available())
            .await
            .context("resetting exit node peers")?;

        let domain = &self.config.mesh_domain;
        let mut hosts = vec![Host::for_mesh_machine(
            machine.address,
            &machine.hostname,
            &machine.nickname,
            domain,
        )];
        hosts.extend(topology.peers.iter().filter_map(|peer| {
            peer.address.map(|address| {
                Host::for_mesh_machine(address, &peer.hostname, &peer.nickname, domain)
            })
        }));

        self.publish("updating mesh dns");
        self.hosts.set_hosts(hosts).await.context("setting mesh hosts")?;

        debug!("done refreshing mesh");
        self.publish("refreshing mesh");
        Ok(())
    }

    /// Rebuild the mesh after a network change, reusing the last identity
    pub(super) async fn rebuild_mesh(&mut self, self_addr: Option<IpAddr>) -> Result<(), NetworkerError> {
        let (Some(topology), Some(private_key)) = (
            self.state.topology.clone(),
            self.state.last_private_key.clone(),
        ) else {
            return Err(NetworkerError::MeshNotActive);
        };
        let self_addr = self_addr.unwrap_or(topology.machine.address);

        self.unset_mesh().await.context("unsetting mesh")?;
        self.set_mesh(topology, self_addr, private_key)
            .await
            .context("setting mesh")
    }

    /// Block everything from the mesh subnet except replies to our own connections
    async fn default_mesh_block(&mut self, self_addr: IpAddr) -> Result<(), NetworkerError> {
        self.firewall
            .add(vec![
                Rule {
                    direction: Direction::Inbound,
                    remote_networks: vec![DEFAULT_MESH_SUBNET],
                    allow: false,
                    comment: MESH_RULE_COMMENT.to_string(),
                    ..Rule::named(DEFAULT_MESH_BLOCK_RULE)
                },
                Rule {
                    direction: Direction::Inbound,
                    remote_networks: vec![DEFAULT_MESH_SUBNET],
                    connection_states: ConnectionStates {
                        src_addr: Some(self_addr),
                        states: vec![ConnectionState::Related, ConnectionState::Established],
                    },
                    allow: true,
                    comment: MESH_RULE_COMMENT.to_string(),
                    ..Rule::named(DEFAULT_MESH_ALLOW_ESTABLISHED_RULE)
                },
            ])
            .await?;
        self.state.rules.push(DEFAULT_MESH_BLOCK_RULE.to_string());
        self.state
            .rules
            .push(DEFAULT_MESH_ALLOW_ESTABLISHED_RULE.to_string());
        Ok(())
    }

    /// Remove every mesh rule, including per-peer ones. Rules that could
    /// not be deleted stay tracked for the next attempt.
    async fn default_mesh_unblock(&mut self) -> Result<(), NetworkerError> {
        let mut first_error = None;
        let mut kept = Vec::new();
        for name in std::mem::take(&mut self.state.rules) {
            if let Err(e) = self.firewall.delete(std::slice::from_ref(&name)).await {
                kept.push(name);
                first_error.get_or_insert(e);
            }
        }
        self.state.rules = kept;
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub(super) async fn allow_incoming(
        &mut self,
        public_key: &PublicKey,
        address: IpAddr,
        lan_allowed: bool,
    ) -> Result<(), NetworkerError> {
        let allow_name = rule_name(public_key, ALLOW_INCOMING_RULE, address);
        if self.state.rules.contains(&allow_name) {
            return Err(NetworkerError::RuleAlreadyExists(allow_name));
        }

        let mut rules = vec![Rule {
            direction: Direction::Inbound,
            remote_networks: vec![host_net(address)],
            allow: true,
            comment: MESH_RULE_COMMENT.to_string(),
            ..Rule::named(allow_name.clone())
        }];
        let block_lan_name = rule_name(public_key, BLOCK_LAN_RULE, address);
        if !lan_allowed {
            rules.push(Rule {
                direction: Direction::Inbound,
                local_networks: private_subnets(),
                remote_networks: vec![host_net(address)],
                allow: false,
                comment: MESH_RULE_COMMENT.to_string(),
                ..Rule::named(block_lan_name.clone())
            });
        }

        self.firewall
            .add(rules)
            .await
            .context("adding allow-incoming rule to firewall")?;

        if !lan_allowed {
            self.state.rules.push(block_lan_name);
        }
        self.state.rules.push(allow_name);
        Ok(())
    }

    pub(super) async fn block_incoming(
        &mut self,
        public_key: &PublicKey,
        address: IpAddr,
    ) -> Result<(), NetworkerError> {
        let block_lan_name = rule_name(public_key, BLOCK_LAN_RULE, address);
        if self.state.rules.contains(&block_lan_name) {
            self.remove_rule(&block_lan_name).await?;
        }
        self.remove_rule(&rule_name(public_key, ALLOW_INCOMING_RULE, address))
            .await
    }

    async fn remove_rule(&mut self, name: &str) -> Result<(), NetworkerError> {
        let Some(index) = self.state.rules.iter().position(|rule| rule == name) else {
            return Err(NetworkerError::NoSuchRule(name.to_string()));
        };
        self.firewall.delete(&[name.to_string()]).await?;
        self.state.rules.remove(index);
        Ok(())
    }

    pub(super) async fn allow_fileshare(
        &mut self,
        public_key: &PublicKey,
        address: IpAddr,
    ) -> Result<(), NetworkerError> {
        if !self.state.fileshare_permitted {
            warn!("fileshare is not permitted, skipping allow rule");
            return Ok(());
        }

        let name = rule_name(public_key, ALLOW_FILESHARE_RULE, address);
        if self.state.rules.contains(&name) {
            return Err(NetworkerError::RuleAlreadyExists(name));
        }

        self.firewall
            .add(vec![Rule {
                direction: Direction::Inbound,
                protocols: vec![IpProtocol::Tcp],
                ports: vec![FILESHARE_PORT],
                ports_direction: PortsDirection::Destination,
                remote_networks: vec![host_net(address)],
                allow: true,
                comment: MESH_RULE_COMMENT.to_string(),
                ..Rule::named(name.clone())
            }])
            .await
            .context("adding allow-fileshare rule to firewall")?;
        self.state.rules.push(name);
        Ok(())
    }

    async fn block_fileshare(
        &mut self,
        public_key: &PublicKey,
        address: IpAddr,
    ) -> Result<(), NetworkerError> {
        self.remove_rule(&rule_name(public_key, ALLOW_FILESHARE_RULE, address))
            .await
    }

    fn fileshare_peers(&self) -> Vec<(PublicKey, IpAddr)> {
        self.state
            .topology
            .iter()
            .flat_map(|topology| topology.peers.iter())
            .filter(|peer| peer.allows_fileshare)
            .filter_map(|peer| peer.address.map(|address| (peer.public_key, address)))
            .collect()
    }

    /// Every peer is tried, the first failure is returned
    pub(super) async fn permit_fileshare(&mut self) -> Result<(), NetworkerError> {
        if self.state.fileshare_permitted {
            return Ok(());
        }
        self.state.fileshare_permitted = true;

        let mut result = Ok(());
        for (public_key, address) in self.fileshare_peers() {
            if let Err(e) = self.allow_fileshare(&public_key, address).await {
                warn!(peer = %public_key, "failed to allow fileshare: {}", e);
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Stays permitted when a rule could not be removed, so it can be retried
    pub(super) async fn forbid_fileshare(&mut self) -> Result<(), NetworkerError> {
        if !self.state.fileshare_permitted {
            return Ok(());
        }

        let mut result = Ok(());
        for (public_key, address) in self.fileshare_peers() {
            match self.block_fileshare(&public_key, address).await {
                Ok(()) => {}
                Err(e) if e.is_no_such_rule() => {}
                Err(e) => {
                    warn!(peer = %public_key, "failed to remove fileshare rule: {}", e);
                    result = result.and(Err(e));
                }
            }
        }

        if result.is_ok() {
            self.state.fileshare_permitted = false;
        }
        result
    }

    /// Re-create the allow rule of one peer from its current permissions
    async fn refresh_incoming(&mut self, peer: &MeshPeer) -> Result<(), NetworkerError> {
        if !peer.allows_inbound {
            return Ok(());
        }
        let address = peer.address.ok_or(NetworkerError::MeshPeerNotRoutable)?;

        let name = rule_name(&peer.public_key, ALLOW_INCOMING_RULE, address);
        if self.state.rules.contains(&name) {
            self.block_incoming(&peer.public_key, address)
                .await
                .context("blocking incoming traffic")?;
        }
        self.allow_incoming(&peer.public_key, address, peer.lan_allowed())
            .await
            .context("allowing incoming traffic")
    }

    pub(super) async fn reset_routing(
        &mut self,
        peer: &MeshPeer,
        peers: &[MeshPeer],
    ) -> Result<(), NetworkerError> {
        if !peers.iter().any(|p| p.public_key == peer.public_key) {
            return Err(NetworkerError::MeshPeerNotFound);
        }
        self.exit_node
            .reset_peers(peers, self.lan_available())
            .await
            .context("resetting exit node peers")?;
        self.refresh_incoming(peer).await
    }
}
