//! Scenario files
//!
//! A scenario is an ordered list of orchestrator calls and fault
//! injections, replayed against the dry-run collaborators.

use anyhow::{Context, Result};
use netplane::dryrun::DryRunSystem;
use netplane::{
    Allowlist, Credentials, MeshTopology, Networker, PrivateKey, PublicKey, ServerData,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

/// A scenario file
#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Keep going after a failed step
    #[serde(default)]
    pub continue_on_error: bool,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

fn default_true() -> bool {
    true
}

/// Collaborator failures that can be switched on and off
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    TunnelStart,
    RoutingRules,
    Dns,
    Hosts,
    Devices,
    MeshEnable,
    MeshRefresh,
    ExitNode,
}

/// One scenario step
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Start {
        #[serde(default)]
        creds: Credentials,
        server: ServerData,
        #[serde(default)]
        allowlist: Allowlist,
        #[serde(default)]
        nameservers: Vec<String>,
        #[serde(default = "default_true")]
        enable_local_traffic: bool,
    },
    Stop,
    SetDns {
        nameservers: Vec<String>,
    },
    UnsetDns,
    SetAllowlist {
        allowlist: Allowlist,
    },
    UnsetAllowlist,
    SetKillSwitch {
        #[serde(default)]
        allowlist: Allowlist,
    },
    UnsetKillSwitch,
    PermitIpv6,
    DenyIpv6,
    SetLanDiscovery {
        enabled: bool,
    },
    SetMesh {
        topology: MeshTopology,
        /// Base64 private key, a fresh one when absent
        #[serde(default)]
        private_key: Option<String>,
        /// Defaults to the machine address of the topology
        #[serde(default)]
        self_address: Option<IpAddr>,
    },
    UnsetMesh,
    Refresh {
        topology: MeshTopology,
    },
    AllowIncoming {
        public_key: PublicKey,
        address: IpAddr,
        #[serde(default)]
        lan_allowed: bool,
    },
    BlockIncoming {
        public_key: PublicKey,
        address: IpAddr,
    },
    PermitFileshare,
    ForbidFileshare,
    Reconnect {
        #[serde(default = "default_true")]
        network_up: bool,
    },
    Inject {
        fault: Fault,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Start { .. } => "start",
            Step::Stop => "stop",
            Step::SetDns { .. } => "set_dns",
            Step::UnsetDns => "unset_dns",
            Step::SetAllowlist { .. } => "set_allowlist",
            Step::UnsetAllowlist => "unset_allowlist",
            Step::SetKillSwitch { .. } => "set_kill_switch",
            Step::UnsetKillSwitch => "unset_kill_switch",
            Step::PermitIpv6 => "permit_ipv6",
            Step::DenyIpv6 => "deny_ipv6",
            Step::SetLanDiscovery { .. } => "set_lan_discovery",
            Step::SetMesh { .. } => "set_mesh",
            Step::UnsetMesh => "unset_mesh",
            Step::Refresh { .. } => "refresh",
            Step::AllowIncoming { .. } => "allow_incoming",
            Step::BlockIncoming { .. } => "block_incoming",
            Step::PermitFileshare => "permit_fileshare",
            Step::ForbidFileshare => "forbid_fileshare",
            Step::Reconnect { .. } => "reconnect",
            Step::Inject { .. } => "inject",
        }
    }
}

/// Outcome of one step
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn inject(system: &DryRunSystem, fault: Fault, enabled: bool) {
    match fault {
        Fault::TunnelStart => system.vpn.set_fail_start(enabled),
        Fault::RoutingRules => system.policy.set_failing(enabled),
        Fault::Dns => system.dns.set_failing(enabled),
        Fault::Hosts => system.hosts.set_failing(enabled),
        Fault::Devices => system.devices.set_failing(enabled),
        Fault::MeshEnable => system.mesh.set_fail_enable(enabled),
        Fault::MeshRefresh => system.mesh.set_fail_refresh(enabled),
        Fault::ExitNode => system.exit_node.set_failing(enabled),
    }
}

async fn apply(networker: &Networker, system: &DryRunSystem, step: Step) -> Result<()> {
    match step {
        Step::Start {
            creds,
            server,
            allowlist,
            nameservers,
            enable_local_traffic,
        } => {
            networker
                .start(creds, server, allowlist, nameservers, enable_local_traffic)
                .await?
        }
        Step::Stop => networker.stop().await?,
        Step::SetDns { nameservers } => networker.set_dns(nameservers).await?,
        Step::UnsetDns => networker.unset_dns().await?,
        Step::SetAllowlist { allowlist } => networker.set_allowlist(allowlist).await?,
        Step::UnsetAllowlist => networker.unset_allowlist().await?,
        Step::SetKillSwitch { allowlist } => networker.set_kill_switch(allowlist).await?,
        Step::UnsetKillSwitch => networker.unset_kill_switch().await?,
        Step::PermitIpv6 => networker.permit_ipv6().await?,
        Step::DenyIpv6 => networker.deny_ipv6().await?,
        Step::SetLanDiscovery { enabled } => networker.set_lan_discovery(enabled).await,
        Step::SetMesh {
            topology,
            private_key,
            self_address,
        } => {
            let private_key = match private_key {
                Some(encoded) => encoded
                    .parse::<PrivateKey>()
                    .context("parsing mesh private key")?,
                None => PrivateKey::generate(),
            };
            let self_address = self_address.unwrap_or(topology.machine.address);
            networker
                .set_mesh(topology, self_address, private_key)
                .await?
        }
        Step::UnsetMesh => networker.unset_mesh().await?,
        Step::Refresh { topology } => networker.refresh(topology).await?,
        Step::AllowIncoming {
            public_key,
            address,
            lan_allowed,
        } => {
            networker
                .allow_incoming(&public_key, address, lan_allowed)
                .await?
        }
        Step::BlockIncoming {
            public_key,
            address,
        } => networker.block_incoming(&public_key, address).await?,
        Step::PermitFileshare => networker.permit_fileshare().await?,
        Step::ForbidFileshare => networker.forbid_fileshare().await?,
        Step::Reconnect { network_up } => networker.reconnect(network_up).await?,
        Step::Inject { fault, enabled } => inject(system, fault, enabled),
    }
    Ok(())
}

/// Replay a scenario, stopping at the first failure unless told otherwise
pub async fn run(
    networker: &Networker,
    system: &DryRunSystem,
    scenario: Scenario,
) -> Vec<StepReport> {
    let mut reports = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.into_iter().enumerate() {
        let action = step.name();
        info!(index, action, "running step");

        let error = apply(networker, system, step)
            .await
            .err()
            .map(|e| format!("{e:#}"));
        let failed = error.is_some();
        if let Some(e) = &error {
            warn!(index, action, "step failed: {}", e);
        }
        reports.push(StepReport {
            index,
            action,
            error,
        });

        if failed && !scenario.continue_on_error {
            break;
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let scenario: Scenario = toml::from_str(
            r#"
            [[steps]]
            action = "start"
            server = { ip = "1.2.3.0", hostname = "de1.example.com" }
            nameservers = ["1.1.1.1"]

            [[steps]]
            action = "inject"
            fault = "dns"

            [[steps]]
            action = "reconnect"
            "#,
        )
        .unwrap();

        assert!(!scenario.continue_on_error);
        assert_eq!(scenario.steps.len(), 3);
        assert!(matches!(
            scenario.steps[1],
            Step::Inject {
                fault: Fault::Dns,
                enabled: true
            }
        ));
        assert!(matches!(
            scenario.steps[2],
            Step::Reconnect { network_up: true }
        ));
    }

    #[test]
    fn test_sample_scenarios_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
        for name in ["network-flap.toml", "mesh-peers.toml", "rollback.toml"] {
            let scenario = Scenario::from_file(&dir.join(name)).unwrap();
            assert!(!scenario.steps.is_empty(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let system = DryRunSystem::new();
        let networker = system.networker(Default::default());
        let scenario: Scenario = toml::from_str(
            r#"
            [[steps]]
            action = "inject"
            fault = "tunnel_start"

            [[steps]]
            action = "start"
            server = { ip = "1.2.3.0" }

            [[steps]]
            action = "set_kill_switch"
            "#,
        )
        .unwrap();

        let reports = run(&networker, &system, scenario).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].error.is_none());
        assert!(reports[1].error.is_some());
        assert!(!networker.is_network_set().await);
    }
}
