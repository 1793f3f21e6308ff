use super::*;
use crate::config::{Ports, Technology};
use crate::device::Interface;
use crate::dryrun::{DRY_RUN_TABLE_ID, DryRunGateway, DryRunSystem, DryRunVpn};
use crate::mesh::MeshMachine;
use crate::routes::Route;
use crate::tunnel::TunnelState;

fn server(ip: &str) -> ServerData {
    ServerData::new(ip.parse().unwrap())
}

fn creds() -> Credentials {
    Credentials {
        username: "user".into(),
        password: "secret".into(),
        private_key: None,
    }
}

fn ns(servers: &[&str]) -> Vec<String> {
    servers.iter().map(|s| s.to_string()).collect()
}

fn key(seed: u8) -> PrivateKey {
    PrivateKey::from_bytes([seed; 32])
}

fn peer(seed: u8, address: &str) -> MeshPeer {
    MeshPeer {
        public_key: key(seed).public_key(),
        hostname: format!("peer-{seed}.nord"),
        nickname: String::new(),
        address: Some(address.parse().unwrap()),
        allows_inbound: false,
        allows_routing: false,
        allows_local_network: false,
        allows_fileshare: false,
    }
}

fn topology(peers: Vec<MeshPeer>) -> MeshTopology {
    MeshTopology {
        machine: MeshMachine {
            public_key: key(1).public_key(),
            hostname: "self-host.nord".into(),
            nickname: String::new(),
            address: "100.64.0.1".parse().unwrap(),
        },
        peers,
    }
}

fn setup() -> (DryRunSystem, Networker) {
    let sys = DryRunSystem::new();
    let networker = sys.networker(NetworkerConfig::default());
    (sys, networker)
}

async fn connect(networker: &Networker, ip: &str, allowlist: Allowlist) {
    networker
        .start(creds(), server(ip), allowlist, ns(&["1.1.1.1"]), true)
        .await
        .unwrap();
}

async fn enable_mesh(networker: &Networker, peers: Vec<MeshPeer>) {
    networker
        .set_mesh(topology(peers), "100.64.0.1".parse().unwrap(), key(1))
        .await
        .unwrap();
}

fn allow_rule(seed: u8, address: &str) -> String {
    format!("{}-allow-rule-{address}", key(seed).public_key())
}

fn block_lan_rule(seed: u8, address: &str) -> String {
    format!("{}-block-lan-rule-{address}", key(seed).public_key())
}

fn fileshare_rule(seed: u8, address: &str) -> String {
    format!("{}-allow-fileshare-rule-{address}", key(seed).public_key())
}

#[tokio::test]
async fn test_start_and_stop() {
    let (sys, networker) = setup();

    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    assert!(networker.is_vpn_active().await);
    assert!(networker.is_network_set().await);
    let effects = sys.effects();
    assert_eq!(
        effects.firewall_rules,
        vec!["drop", "api_allowlist", "deny-private-dns"]
    );
    assert_eq!(effects.default_routes.len(), 1);
    assert_eq!(effects.default_routes[0].device.name, "nordlynx");
    assert_eq!(effects.default_routes[0].table_id, DRY_RUN_TABLE_ID);
    assert_eq!(effects.policy_routing.unwrap().device.name, "nordlynx");
    assert!(effects.ipv6_blocked);
    assert_eq!(sys.firewall.rule("api_allowlist").unwrap().marks, vec![0xe1f1]);

    networker.stop().await.unwrap();

    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    let effects = sys.effects();
    assert!(effects.firewall_rules.is_empty());
    assert!(effects.default_routes.is_empty());
    assert!(effects.policy_routing.is_none());
    assert!(effects.nameservers.is_empty());
    assert!(!effects.ipv6_blocked);
}

#[tokio::test]
async fn test_start_twice_restarts() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    connect(&networker, "5.6.7.8", Allowlist::default()).await;

    assert_eq!(sys.vpn.starts(), 2);
    assert_eq!(sys.vpn.last_server().unwrap().ip.to_string(), "5.6.7.8");
    let (last, connected) = networker.connection_parameters().await;
    assert_eq!(last.ip.to_string(), "5.6.7.8");
    assert!(connected);
    // firewall state is untouched by a restart
    assert_eq!(
        sys.firewall.applied(),
        vec!["drop", "api_allowlist", "deny-private-dns"]
    );
    assert_eq!(sys.default_routes.routes().len(), 1);
}

#[tokio::test]
async fn test_restart_reuses_last_server() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker
        .restart(creds(), ServerData::default(), ns(&["1.1.1.1"]))
        .await
        .unwrap();

    assert_eq!(sys.vpn.last_server().unwrap().ip.to_string(), "1.2.3.0");
}

#[tokio::test]
async fn test_restart_while_idle_does_a_full_start() {
    let (sys, networker) = setup();
    let allowlist = Allowlist::with_subnets(["192.168.5.0/24".parse().unwrap()]);
    networker.set_allowlist(allowlist).await.unwrap();

    networker
        .restart(creds(), server("1.2.3.0"), ns(&["1.1.1.1"]))
        .await
        .unwrap();

    assert!(networker.is_vpn_active().await);
    assert!(networker.is_network_set().await);
    let effects = sys.effects();
    assert_eq!(
        effects.firewall_rules,
        vec!["drop", "api_allowlist", "allowlist_subnets", "deny-private-dns"]
    );
    assert_eq!(effects.policy_routing.unwrap().device.name, "nordlynx");
    assert_eq!(effects.default_routes.len(), 1);
    assert!(effects.ipv6_blocked);
}

#[tokio::test]
async fn test_failed_restart_rolls_back() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    sys.dns.set_failing(true);

    let err = networker
        .start(creds(), server("5.6.7.8"), Allowlist::default(), ns(&["1.1.1.1"]), true)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Dns(_)));
    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    assert!(!networker.flags().await.vpn_set);
    assert!(sys.vpn.tunnel().is_none());
    let effects = sys.effects();
    assert!(effects.firewall_rules.is_empty());
    assert!(effects.default_routes.is_empty());
    assert!(effects.policy_routing.is_none());

    // nothing half-applied blocks the next attempt
    sys.dns.set_failing(false);
    connect(&networker, "5.6.7.8", Allowlist::default()).await;
    assert!(networker.is_vpn_active().await);
}

#[tokio::test]
async fn test_failed_restart_keeps_kill_switch_rules() {
    let (sys, networker) = setup();
    networker.set_kill_switch(Allowlist::default()).await.unwrap();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    sys.vpn.set_fail_start(true);

    assert!(
        networker
            .restart(creds(), server("5.6.7.8"), ns(&["1.1.1.1"]))
            .await
            .is_err()
    );

    assert!(!networker.is_vpn_active().await);
    assert!(networker.is_network_set().await);
    assert!(sys.firewall.applied().contains(&"drop".to_string()));
    assert!(sys.default_routes.routes().is_empty());
}

#[tokio::test]
async fn test_stop_and_unset_kill_switch_are_idempotent() {
    let (sys, networker) = setup();

    networker.stop().await.unwrap();
    networker.unset_kill_switch().await.unwrap();

    assert!(!networker.is_network_set().await);
    assert!(sys.firewall.applied().is_empty());
    assert_eq!(sys.vpn.starts(), 0);
}

#[tokio::test]
async fn test_stop_without_vpn_implementation() {
    let sys = DryRunSystem::new();
    let deps = NetworkerDeps {
        vpn: None,
        mesh: sys.mesh.clone(),
        gateway: sys.gateway.clone(),
        firewall: Arc::new(crate::firewall::FirewallManager::new(sys.firewall.clone(), true)),
        router: Arc::new(crate::routes::Router::new(sys.default_routes.clone(), true)),
        allowlist_router: Arc::new(crate::routes::Router::new(sys.allowlist_routes.clone(), true)),
        peer_router: Arc::new(crate::routes::Router::new(sys.peer_routes.clone(), true)),
        policy_router: sys.policy.clone(),
        dns: sys.dns.clone(),
        hosts: sys.hosts.clone(),
        ipv6: sys.ipv6.clone(),
        exit_node: sys.exit_node.clone(),
        devices: sys.devices.clone(),
    };
    let networker = Networker::new(NetworkerConfig::default(), deps);

    let err = networker
        .start(creds(), server("1.2.3.0"), Allowlist::default(), vec![], true)
        .await
        .unwrap_err();
    assert!(err.is_nil_vpn());
    assert!(sys.firewall.applied().is_empty());
    assert!(networker.stop().await.is_ok());
}

#[tokio::test]
async fn test_rollback_on_tunnel_start_failure() {
    let (sys, networker) = setup();
    sys.vpn.set_fail_start(true);

    let err = networker
        .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), true)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Tunnel(_)));
    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    assert!(sys.firewall.applied().is_empty());
}

#[tokio::test]
async fn test_rollback_on_routing_rule_failure() {
    let (sys, networker) = setup();
    sys.policy.set_failing(true);

    assert!(
        networker
            .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), true)
            .await
            .is_err()
    );

    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    assert!(sys.vpn.tunnel().is_none());
}

#[tokio::test]
async fn test_rollback_on_dns_failure() {
    let (sys, networker) = setup();
    sys.dns.set_failing(true);

    let err = networker
        .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), true)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Dns(_)));
    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    let effects = sys.effects();
    assert!(effects.firewall_rules.is_empty());
    assert!(effects.default_routes.is_empty());
    assert!(effects.policy_routing.is_none());
}

#[tokio::test]
async fn test_rollback_on_device_listing_failure() {
    let (sys, networker) = setup();
    sys.devices.set_failing(true);

    let err = networker
        .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), true)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Device(_)));
    assert!(!networker.is_vpn_active().await);
    assert!(!networker.is_network_set().await);
    assert!(sys.firewall.applied().is_empty());
}

#[tokio::test]
async fn test_rollback_keeps_kill_switch_rules() {
    let (sys, networker) = setup();
    networker.set_kill_switch(Allowlist::default()).await.unwrap();
    sys.dns.set_failing(true);

    assert!(
        networker
            .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), true)
            .await
            .is_err()
    );

    assert!(networker.is_network_set().await);
    assert!(!networker.is_vpn_active().await);
    assert!(sys.firewall.applied().contains(&"drop".to_string()));
    assert!(networker.flags().await.kill_switch_set);
}

#[tokio::test]
async fn test_kill_switch_outlives_vpn() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    networker.set_kill_switch(Allowlist::default()).await.unwrap();

    networker.stop().await.unwrap();
    assert!(networker.is_network_set().await);
    assert!(sys.firewall.applied().contains(&"drop".to_string()));

    networker.unset_kill_switch().await.unwrap();
    assert!(!networker.is_network_set().await);
    assert!(sys.firewall.applied().is_empty());
}

#[tokio::test]
async fn test_vpn_outlives_kill_switch() {
    let (_sys, networker) = setup();
    networker.set_kill_switch(Allowlist::default()).await.unwrap();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.unset_kill_switch().await.unwrap();

    assert!(networker.is_network_set().await);
    assert!(!networker.flags().await.kill_switch_set);
}

#[tokio::test]
async fn test_mesh_owns_routing_without_vpn() {
    let (sys, networker) = setup();

    enable_mesh(&networker, vec![]).await;

    let mesh_device = sys.mesh.interface();
    let routes = sys.peer_routes.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].subnet, crate::mesh::DEFAULT_MESH_SUBNET);
    assert_eq!(routes[0].device, mesh_device);
    assert_eq!(sys.policy.binding().unwrap().device, mesh_device);
    assert!(sys.default_routes.routes().is_empty());
    assert!(networker.is_mesh_active().await);
}

#[tokio::test]
async fn test_vpn_reclaims_default_route_after_mesh() {
    let (sys, networker) = setup();
    enable_mesh(&networker, vec![]).await;
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    // mesh keeps the policy binding while active
    assert_eq!(sys.policy.binding().unwrap().device.name, "nordmesh");

    networker.unset_mesh().await.unwrap();

    let routes = sys.default_routes.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].device.name, "nordlynx");
    assert_eq!(sys.policy.binding().unwrap().device.name, "nordlynx");
    assert!(sys.peer_routes.routes().is_empty());
    assert!(!networker.is_mesh_active().await);
}

#[tokio::test]
async fn test_stop_rebinds_routing_to_mesh() {
    let (sys, networker) = setup();
    enable_mesh(&networker, vec![]).await;
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.stop().await.unwrap();

    assert_eq!(sys.policy.binding().unwrap().device.name, "nordmesh");
    assert!(sys.default_routes.routes().is_empty());
    assert_eq!(sys.peer_routes.routes().len(), 1);
}

#[tokio::test]
async fn test_server_inside_mesh_uses_fallback_resolvers() {
    let sys = DryRunSystem::new();
    let config = NetworkerConfig {
        fallback_nameservers: ns(&["103.86.96.100", "2606:4700::1111"]),
        ..NetworkerConfig::default()
    };
    let networker = sys.networker(config);
    enable_mesh(&networker, vec![]).await;

    connect(&networker, "100.64.0.9", Allowlist::default()).await;

    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["103.86.96.100"])));
}

#[tokio::test]
async fn test_server_outside_mesh_uses_given_resolvers() {
    let (sys, networker) = setup();
    enable_mesh(&networker, vec![]).await;

    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["1.1.1.1"])));
}

#[tokio::test]
async fn test_mesh_subnet_server_without_mesh_uses_given_resolvers() {
    let (sys, networker) = setup();

    connect(&networker, "100.64.0.9", Allowlist::default()).await;

    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["1.1.1.1"])));
}

#[tokio::test]
async fn test_allow_and_block_incoming() {
    let (sys, networker) = setup();
    let public_key = key(2).public_key();
    let address = "100.64.0.2".parse().unwrap();

    networker
        .allow_incoming(&public_key, address, true)
        .await
        .unwrap();
    assert!(sys.firewall.applied().contains(&allow_rule(2, "100.64.0.2")));

    let err = networker
        .allow_incoming(&public_key, address, true)
        .await
        .unwrap_err();
    assert!(err.is_rule_already_exists());

    networker.block_incoming(&public_key, address).await.unwrap();
    assert!(!sys.firewall.applied().contains(&allow_rule(2, "100.64.0.2")));

    let err = networker
        .block_incoming(&public_key, address)
        .await
        .unwrap_err();
    assert!(err.is_no_such_rule());
}

#[tokio::test]
async fn test_block_lan_rule_follows_allow_rule() {
    let (sys, networker) = setup();
    let public_key = key(3).public_key();
    let address = "100.64.0.3".parse().unwrap();

    networker
        .allow_incoming(&public_key, address, false)
        .await
        .unwrap();
    let rule = sys.firewall.rule(&block_lan_rule(3, "100.64.0.3")).unwrap();
    assert!(!rule.allow);
    assert_eq!(rule.remote_networks, vec!["100.64.0.3/32".parse().unwrap()]);

    networker.block_incoming(&public_key, address).await.unwrap();
    assert!(sys.firewall.applied().is_empty());
}

#[tokio::test]
async fn test_lan_discovery_override() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    networker.set_kill_switch(Allowlist::default()).await.unwrap();

    networker.set_lan_discovery(true).await;
    assert_eq!(sys.exit_node.lan_available(), Some(true));
    assert!(sys.policy.binding().unwrap().lan_enabled);

    networker.unset_kill_switch().await.unwrap();
    assert_eq!(sys.exit_node.lan_available(), Some(true));

    networker.set_lan_discovery(false).await;
    assert_eq!(sys.exit_node.lan_available(), Some(false));
}

#[tokio::test]
async fn test_local_traffic_flag_reaches_policy_routing() {
    let (sys, networker) = setup();
    networker
        .start(creds(), server("1.2.3.0"), Allowlist::default(), ns(&["1.1.1.1"]), false)
        .await
        .unwrap();
    assert!(!sys.policy.binding().unwrap().enable_local);

    networker.set_lan_discovery(true).await;
    let binding = sys.policy.binding().unwrap();
    assert!(!binding.enable_local);
    assert!(binding.lan_enabled);

    // turning mesh off restores local traffic
    enable_mesh(&networker, vec![]).await;
    networker.unset_mesh().await.unwrap();
    let binding = sys.policy.binding().unwrap();
    assert_eq!(binding.device.name, "nordlynx");
    assert!(binding.enable_local);
}

#[tokio::test]
async fn test_lan_discovery_adds_private_ranges() {
    let (sys, networker) = setup();
    networker.set_lan_discovery(true).await;

    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    let rule = sys.firewall.rule("allowlist_subnets").unwrap();
    assert!(rule.remote_networks.contains(&"192.168.0.0/16".parse().unwrap()));
    // private ranges are reachable directly
    assert!(sys.allowlist_routes.routes().is_empty());
}

#[tokio::test]
async fn test_dns_survives_network_flap() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["1.1.1.1"])));

    networker.set_dns(ns(&["2.2.2.2"])).await.unwrap();
    networker.reconnect(true).await.unwrap();

    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["2.2.2.2"])));
    assert_eq!(sys.vpn.starts(), 2);
    let flags = networker.flags().await;
    assert!(flags.vpn_set);
    assert!(flags.network_set);
    assert!(!flags.kill_switch_set);
}

#[tokio::test]
async fn test_reconnect_keeps_kill_switch() {
    let (sys, networker) = setup();
    networker.set_kill_switch(Allowlist::default()).await.unwrap();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.reconnect(true).await.unwrap();

    assert!(networker.flags().await.kill_switch_set);
    assert!(sys.firewall.applied().contains(&"drop".to_string()));
}

#[tokio::test]
async fn test_reconnect_failure_keeps_rules() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    sys.vpn.set_fail_start(true);

    assert!(networker.reconnect(true).await.is_err());

    let flags = networker.flags().await;
    assert!(!flags.vpn_set);
    assert!(!flags.kill_switch_set);
    // no traffic leaks while nobody reconnects
    assert!(flags.network_set);
    assert!(sys.firewall.applied().contains(&"drop".to_string()));
}

#[tokio::test]
async fn test_reconnect_rebuilds_mesh_and_vpn() {
    let (sys, networker) = setup();
    enable_mesh(&networker, vec![]).await;
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.reconnect(true).await.unwrap();

    assert!(networker.is_mesh_active().await);
    assert!(networker.is_vpn_active().await);
    assert_eq!(sys.mesh.identity(), Some(key(1).public_key()));
    assert_eq!(sys.default_routes.routes()[0].device.name, "nordlynx");
    assert_eq!(sys.peer_routes.routes()[0].device.name, "nordmesh");
    assert_eq!(sys.policy.binding().unwrap().device.name, "nordmesh");
}

#[tokio::test]
async fn test_reconnect_network_down_only_blocks_ipv6() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.reconnect(false).await.unwrap();

    assert_eq!(sys.vpn.starts(), 1);
    assert!(sys.ipv6.is_blocked());
}

#[tokio::test]
async fn test_public_subnet_gets_route() {
    let (sys, networker) = setup();
    let allowlist = Allowlist::with_subnets(["1.2.3.0/24".parse().unwrap()]);

    connect(&networker, "5.6.7.8", allowlist).await;

    let routes = sys.allowlist_routes.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].gateway, Some("192.168.1.1".parse().unwrap()));
    assert_eq!(routes[0].device.name, "eth0");
    // the allowlist is applied twice, the gateway is looked up once
    assert_eq!(sys.gateway.lookups(), 1);
}

#[tokio::test]
async fn test_private_subnet_gets_firewall_exception_only() {
    let (sys, networker) = setup();
    let allowlist = Allowlist::with_subnets(["192.168.5.0/24".parse().unwrap()]);

    connect(&networker, "5.6.7.8", allowlist).await;

    assert!(sys.allowlist_routes.routes().is_empty());
    assert!(sys.firewall.rule("allowlist_subnets").is_some());
}

#[tokio::test]
async fn test_conflicting_route_is_tolerated() {
    let (sys, networker) = setup();
    sys.allowlist_routes.add_foreign_route(Route {
        subnet: "1.2.3.0/24".parse().unwrap(),
        gateway: Some("10.0.0.1".parse().unwrap()),
        device: Interface::new("eth1", 4),
        table_id: DRY_RUN_TABLE_ID,
    });
    let allowlist = Allowlist::with_subnets(["1.2.3.0/24".parse().unwrap()]);

    connect(&networker, "5.6.7.8", allowlist).await;

    assert!(sys.allowlist_routes.routes().is_empty());
    assert!(sys.firewall.rule("allowlist_subnets").is_some());
}

#[tokio::test]
async fn test_missing_gateway_is_tolerated() {
    let sys = DryRunSystem {
        gateway: Arc::new(DryRunGateway::none()),
        ..DryRunSystem::new()
    };
    let networker = sys.networker(NetworkerConfig::default());
    let allowlist = Allowlist::with_subnets(["1.2.3.0/24".parse().unwrap()]);

    connect(&networker, "5.6.7.8", allowlist).await;

    assert!(sys.allowlist_routes.routes().is_empty());
    assert!(sys.firewall.rule("allowlist_subnets").is_some());
}

#[tokio::test]
async fn test_dns_port_in_allowlist_lifts_dns_deny() {
    let (sys, networker) = setup();
    let allowlist = Allowlist {
        ports: Ports {
            udp: [53].into(),
            ..Ports::default()
        },
        ..Allowlist::default()
    };

    connect(&networker, "1.2.3.0", allowlist).await;

    let rules = sys.firewall.applied();
    assert!(rules.contains(&"allowlist_ports_udp".to_string()));
    assert!(!rules.contains(&"deny-private-dns".to_string()));
    assert!(!networker.flags().await.dns_denied);
}

#[tokio::test]
async fn test_replace_and_unset_allowlist() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    let allowlist = Allowlist {
        ports: Ports {
            tcp: [22].into(),
            ..Ports::default()
        },
        ..Allowlist::default()
    };
    networker.set_allowlist(allowlist).await.unwrap();
    assert_eq!(sys.firewall.rule("allowlist_ports_tcp").unwrap().ports, vec![22]);

    networker.unset_allowlist().await.unwrap();
    let rules = sys.firewall.applied();
    assert!(!rules.contains(&"allowlist_ports_tcp".to_string()));
    assert!(rules.contains(&"deny-private-dns".to_string()));
}

#[tokio::test]
async fn test_set_vpn_is_queued_while_connected() {
    let (sys, networker) = setup();
    let openvpn = Arc::new(DryRunVpn::openvpn());
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.set_vpn(openvpn.clone()).await;
    assert_eq!(
        networker.connection_status().await.unwrap().technology,
        Technology::WireGuard
    );

    networker.stop().await.unwrap();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    assert_eq!(sys.vpn.starts(), 1);
    assert_eq!(openvpn.starts(), 1);
    assert_eq!(sys.dns.nameservers("tun0"), Some(ns(&["1.1.1.1"])));
    let status = networker.connection_status().await.unwrap();
    assert_eq!(status.technology, Technology::OpenVpn);
    assert_eq!(status.tunnel_name, "tun0");
}

#[tokio::test]
async fn test_restart_applies_queued_vpn() {
    let (sys, networker) = setup();
    let openvpn = Arc::new(DryRunVpn::openvpn());
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    networker.set_vpn(openvpn.clone()).await;

    connect(&networker, "5.6.7.8", Allowlist::default()).await;

    assert!(sys.vpn.tunnel().is_none());
    assert_eq!(openvpn.last_server().unwrap().ip.to_string(), "5.6.7.8");
    assert_eq!(sys.default_routes.routes()[0].device.name, "tun0");
    assert_eq!(sys.policy.binding().unwrap().device.name, "tun0");
}

#[tokio::test]
async fn test_set_vpn_applies_immediately_when_idle() {
    let (sys, networker) = setup();
    let openvpn = Arc::new(DryRunVpn::openvpn());

    networker.set_vpn(openvpn.clone()).await;
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    assert_eq!(sys.vpn.starts(), 0);
    assert_eq!(openvpn.starts(), 1);
}

#[tokio::test]
async fn test_failed_mesh_enable_closes_tunnel() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    sys.mesh.set_fail_enable(true);

    let err = networker
        .set_mesh(topology(vec![]), "100.64.0.1".parse().unwrap(), key(1))
        .await
        .unwrap_err();

    assert!(err.is_tunnel_closed());
    assert!(!networker.flags().await.vpn_set);
    assert!(!networker.is_mesh_active().await);
}

#[tokio::test]
async fn test_mesh_preconditions() {
    let (_sys, networker) = setup();

    assert!(networker.unset_mesh().await.unwrap_err().is_mesh_not_active());
    assert!(
        networker
            .refresh(topology(vec![]))
            .await
            .unwrap_err()
            .is_mesh_not_active()
    );

    enable_mesh(&networker, vec![]).await;
    let err = networker
        .set_mesh(topology(vec![]), "100.64.0.1".parse().unwrap(), key(1))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkerError::MeshAlreadyActive));
}

#[tokio::test]
async fn test_failed_mesh_refresh_unwinds() {
    let (sys, networker) = setup();
    sys.mesh.set_fail_refresh(true);

    let err = networker
        .set_mesh(topology(vec![]), "100.64.0.1".parse().unwrap(), key(1))
        .await
        .unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Mesh(_)));
    assert!(!networker.is_mesh_active().await);
    let effects = sys.effects();
    assert!(effects.peer_routes.is_empty());
    assert!(effects.policy_routing.is_none());
    assert!(effects.firewall_rules.is_empty());
    assert!(!effects.exit_node.enabled);
    assert!(sys.mesh.tun().is_none());
}

#[tokio::test]
async fn test_refresh_installs_peer_rules_and_hosts() {
    let (sys, networker) = setup();
    let mut office = peer(2, "100.64.0.2");
    office.nickname = "office".into();
    office.allows_inbound = true;
    let mut router = peer(3, "100.64.0.3");
    router.allows_routing = true;

    enable_mesh(&networker, vec![office, router]).await;

    let rules = sys.firewall.applied();
    assert!(rules.contains(&"default-mesh-block".to_string()));
    assert!(rules.contains(&"default-mesh-allow-established".to_string()));
    assert!(rules.contains(&allow_rule(1, "100.64.0.1")));
    assert!(rules.contains(&allow_rule(2, "100.64.0.2")));
    assert!(rules.contains(&block_lan_rule(2, "100.64.0.2")));
    assert!(!rules.contains(&allow_rule(3, "100.64.0.3")));

    let established = sys.firewall.rule("default-mesh-allow-established").unwrap();
    assert_eq!(
        established.connection_states.src_addr,
        Some("100.64.0.1".parse().unwrap())
    );

    let hosts = sys.hosts.hosts();
    assert_eq!(hosts.len(), 3);
    assert_eq!(hosts[0].fqdn, "self-host.nord");
    assert_eq!(hosts[1].fqdn, "office");
    assert_eq!(hosts[1].domain_names[0], "office.nord");

    let exit_node = sys.exit_node.state();
    assert!(exit_node.enabled);
    assert_eq!(exit_node.routed_peers, vec![key(3).public_key()]);
    assert_eq!(exit_node.lan_available, Some(true));
}

#[tokio::test]
async fn test_refresh_replaces_peer_rules() {
    let (sys, networker) = setup();
    let mut first = peer(2, "100.64.0.2");
    first.allows_inbound = true;
    enable_mesh(&networker, vec![first]).await;

    let mut second = peer(4, "100.64.0.4");
    second.allows_inbound = true;
    networker.refresh(topology(vec![second])).await.unwrap();

    let rules = sys.firewall.applied();
    assert!(!rules.contains(&allow_rule(2, "100.64.0.2")));
    assert!(rules.contains(&allow_rule(4, "100.64.0.4")));
    assert_eq!(sys.mesh.topology().unwrap().peers[0].public_key, key(4).public_key());
}

#[tokio::test]
async fn test_refresh_tolerates_teardown_failures() {
    let (sys, networker) = setup();
    let mut inbound = peer(2, "100.64.0.2");
    inbound.allows_inbound = true;
    enable_mesh(&networker, vec![inbound]).await;

    sys.firewall.fail_delete_on(&allow_rule(2, "100.64.0.2"));
    sys.hosts.set_fail_unset(true);
    sys.exit_node.set_fail_disable(true);
    networker
        .refresh(topology(vec![peer(2, "100.64.0.2")]))
        .await
        .unwrap();

    let rules = sys.firewall.applied();
    assert!(rules.contains(&"default-mesh-block".to_string()));
    assert!(rules.contains(&allow_rule(1, "100.64.0.1")));
    assert!(!rules.contains(&block_lan_rule(2, "100.64.0.2")));
    assert_eq!(sys.hosts.hosts().len(), 2);
    assert!(sys.exit_node.state().enabled);

    // the rule that could not be deleted goes on the next refresh
    sys.firewall.clear_failure();
    networker
        .refresh(topology(vec![peer(2, "100.64.0.2")]))
        .await
        .unwrap();
    assert!(!sys.firewall.applied().contains(&allow_rule(2, "100.64.0.2")));
}

#[tokio::test]
async fn test_unset_mesh_removes_only_mesh_state() {
    let (sys, networker) = setup();
    let mut inbound = peer(2, "100.64.0.2");
    inbound.allows_inbound = true;
    enable_mesh(&networker, vec![inbound]).await;

    networker.unset_mesh().await.unwrap();

    let effects = sys.effects();
    assert!(effects.firewall_rules.is_empty());
    assert!(effects.hosts.is_empty());
    assert!(effects.peer_routes.is_empty());
    assert!(effects.policy_routing.is_none());
    assert!(!effects.exit_node.enabled);
}

#[tokio::test]
async fn test_unset_mesh_failure_is_returned() {
    let (sys, networker) = setup();
    let mut inbound = peer(2, "100.64.0.2");
    inbound.allows_inbound = true;
    enable_mesh(&networker, vec![inbound]).await;
    sys.exit_node.set_fail_disable(true);

    let err = networker.unset_mesh().await.unwrap_err();

    assert!(matches!(err.root(), NetworkerError::ExitNode(_)));
    assert!(networker.is_mesh_active().await);
    assert!(sys.mesh.tun().is_some());
    // steps before the failure were applied
    assert!(sys.hosts.hosts().is_empty());
    assert!(sys.firewall.applied().is_empty());

    sys.exit_node.set_fail_disable(false);
    networker.unset_mesh().await.unwrap();
    assert!(!networker.is_mesh_active().await);
    assert!(sys.mesh.tun().is_none());
}

#[tokio::test]
async fn test_unset_mesh_hosts_failure_is_returned() {
    let (sys, networker) = setup();
    enable_mesh(&networker, vec![peer(2, "100.64.0.2")]).await;
    sys.hosts.set_fail_unset(true);

    let err = networker.unset_mesh().await.unwrap_err();

    assert!(matches!(err.root(), NetworkerError::Dns(_)));
    assert!(networker.is_mesh_active().await);
    assert!(sys.firewall.applied().contains(&"default-mesh-block".to_string()));
}

#[tokio::test]
async fn test_fileshare_permissions() {
    let (sys, networker) = setup();
    let mut sharer = peer(2, "100.64.0.2");
    sharer.allows_fileshare = true;
    enable_mesh(&networker, vec![sharer]).await;
    assert!(!sys.firewall.applied().contains(&fileshare_rule(2, "100.64.0.2")));

    networker.permit_fileshare().await.unwrap();
    let rule = sys.firewall.rule(&fileshare_rule(2, "100.64.0.2")).unwrap();
    assert_eq!(rule.ports, vec![49111]);
    assert!(networker.flags().await.fileshare_permitted);

    networker.forbid_fileshare().await.unwrap();
    assert!(!sys.firewall.applied().contains(&fileshare_rule(2, "100.64.0.2")));
    assert!(!networker.flags().await.fileshare_permitted);

    // already forbidden
    networker.forbid_fileshare().await.unwrap();
}

#[tokio::test]
async fn test_forbid_fileshare_tolerates_missing_rules() {
    let (sys, networker) = setup();
    let mut sharer = peer(2, "100.64.0.2");
    sharer.allows_fileshare = true;
    enable_mesh(&networker, vec![sharer]).await;

    sys.firewall.fail_on(&fileshare_rule(2, "100.64.0.2"));
    assert!(networker.permit_fileshare().await.is_err());
    assert!(networker.flags().await.fileshare_permitted);
    sys.firewall.clear_failure();

    networker.forbid_fileshare().await.unwrap();
    assert!(!networker.flags().await.fileshare_permitted);
}

#[tokio::test]
async fn test_reset_routing() {
    let (sys, networker) = setup();
    let mut inbound = peer(2, "100.64.0.2");
    inbound.allows_inbound = true;
    enable_mesh(&networker, vec![inbound.clone()]).await;
    assert!(sys.firewall.applied().contains(&block_lan_rule(2, "100.64.0.2")));

    inbound.allows_routing = true;
    inbound.allows_local_network = true;
    networker
        .reset_routing(&inbound, &[inbound.clone()])
        .await
        .unwrap();

    let rules = sys.firewall.applied();
    assert!(rules.contains(&allow_rule(2, "100.64.0.2")));
    assert!(!rules.contains(&block_lan_rule(2, "100.64.0.2")));
    assert_eq!(sys.exit_node.state().routed_peers, vec![key(2).public_key()]);
}

#[tokio::test]
async fn test_reset_routing_errors() {
    let (_sys, networker) = setup();
    enable_mesh(&networker, vec![]).await;

    let stranger = peer(5, "100.64.0.5");
    let err = networker.reset_routing(&stranger, &[]).await.unwrap_err();
    assert!(matches!(err, NetworkerError::MeshPeerNotFound));

    let mut unregistered = peer(6, "100.64.0.6");
    unregistered.address = None;
    unregistered.allows_inbound = true;
    let err = networker
        .reset_routing(&unregistered, &[unregistered.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkerError::MeshPeerNotRoutable));
}

#[tokio::test]
async fn test_ipv6_permissions() {
    let sys = DryRunSystem::new();
    let config = NetworkerConfig {
        ipv6_enabled: true,
        ..NetworkerConfig::default()
    };
    let networker = sys.networker(config);
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    assert!(!sys.ipv6.is_blocked());
    assert!(sys.firewall.applied().contains(&"vpn_allowlist_icmp6_errors".to_string()));

    networker.deny_ipv6().await.unwrap();
    assert!(sys.ipv6.is_blocked());
    assert!(sys.firewall.applied().iter().all(|r| !r.starts_with("vpn_allowlist")));

    networker.permit_ipv6().await.unwrap();
    assert!(!sys.ipv6.is_blocked());
    assert!(sys.firewall.applied().contains(&"vpn_allowlist_dhcp6_out".to_string()));
    assert!(networker.flags().await.v6_traffic_allowed);
}

#[tokio::test]
async fn test_unset_firewall() {
    let (sys, networker) = setup();
    networker.set_kill_switch(Allowlist::default()).await.unwrap();

    networker.unset_firewall().await.unwrap();
    assert!(sys.firewall.applied().contains(&"drop".to_string()));

    networker.unset_kill_switch().await.unwrap();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    networker.unset_firewall().await.unwrap();
    assert!(sys.firewall.applied().is_empty());
    assert!(!networker.is_network_set().await);
}

#[tokio::test]
async fn test_firewall_toggle() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.disable_firewall().await.unwrap();
    assert!(sys.firewall.applied().is_empty());

    networker.enable_firewall().await.unwrap();
    assert_eq!(
        sys.firewall.applied(),
        vec!["drop", "api_allowlist", "deny-private-dns"]
    );
}

#[tokio::test]
async fn test_routing_toggle() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    networker.disable_routing().await;
    assert!(sys.default_routes.routes().is_empty());
    assert!(!sys.policy.is_enabled());

    networker.enable_routing().await;
    assert_eq!(sys.default_routes.routes().len(), 1);
    assert!(sys.policy.is_enabled());
}

#[tokio::test]
async fn test_routing_toggle_failures_are_logged() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    sys.default_routes.set_failing(true);

    networker.disable_routing().await;
    assert!(!sys.policy.is_enabled());
    assert_eq!(sys.default_routes.routes().len(), 1);

    networker.enable_routing().await;
    assert!(sys.policy.is_enabled());

    sys.default_routes.set_failing(false);
    networker.disable_routing().await;
    assert!(sys.default_routes.routes().is_empty());
    sys.default_routes.set_failing(true);

    networker.enable_routing().await;
    assert!(sys.policy.is_enabled());
    assert!(sys.default_routes.routes().is_empty());
}

#[tokio::test]
async fn test_set_dns_only_while_connected() {
    let (sys, networker) = setup();

    networker.set_dns(ns(&["9.9.9.9"])).await.unwrap();
    assert!(sys.dns.all().is_empty());

    connect(&networker, "1.2.3.0", Allowlist::default()).await;
    networker.set_dns(ns(&["9.9.9.9"])).await.unwrap();
    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["9.9.9.9"])));

    networker.unset_dns().await.unwrap();
    assert!(sys.dns.all().is_empty());
}

#[tokio::test]
async fn test_rejected_nameservers_are_not_replayed() {
    let (sys, networker) = setup();
    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    sys.dns.set_failing(true);
    assert!(networker.set_dns(ns(&["9.9.9.9"])).await.is_err());
    sys.dns.set_failing(false);

    networker.reconnect(true).await.unwrap();
    assert_eq!(sys.dns.nameservers("nordlynx"), Some(ns(&["1.1.1.1"])));
}

#[tokio::test]
async fn test_connection_status() {
    let (sys, networker) = setup();
    assert_eq!(
        networker.connection_status().await.unwrap().state,
        TunnelState::Disconnected
    );

    let mut data = server("1.2.3.0");
    data.hostname = "de512.example.com".into();
    data.country = "Germany".into();
    networker
        .start(creds(), data, Allowlist::default(), ns(&["1.1.1.1"]), true)
        .await
        .unwrap();
    sys.vpn.tunnel().unwrap().record_traffic(100, 50);

    let status = networker.connection_status().await.unwrap();
    assert_eq!(status.state, TunnelState::Connected);
    assert_eq!(status.technology, Technology::WireGuard);
    assert_eq!(status.ip, Some("1.2.3.0".parse().unwrap()));
    assert_eq!(status.country, "Germany");
    assert_eq!(status.tunnel_name, "nordlynx");
    assert_eq!(status.transfer.rx, 100);
    assert_eq!(status.transfer.tx, 50);
    assert!(status.uptime_secs.is_some());
    assert_eq!(networker.last_server_name().await, "de512.example.com");
}

#[tokio::test]
async fn test_status_map() {
    let (_sys, networker) = setup();
    assert!(networker.status_map().await.is_err());

    let mut pending = peer(3, "100.64.0.3");
    pending.address = None;
    enable_mesh(&networker, vec![peer(2, "100.64.0.2"), pending]).await;

    let statuses = networker.status_map().await.unwrap();
    assert_eq!(statuses[&key(2).public_key()], PeerStatus::Connected);
    assert_eq!(statuses[&key(3).public_key()], PeerStatus::Disconnected);
}

#[tokio::test]
async fn test_progress_events() {
    let (_sys, networker) = setup();
    let mut events = networker.subscribe();

    connect(&networker, "1.2.3.0", Allowlist::default()).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received[0], "starting vpn");
    assert!(received.contains(&"setting the routing rules up".to_string()));
}
