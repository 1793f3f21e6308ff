//! netplane - VPN and Mesh Connection Orchestrator
//!
//! Sequences a VPN tunnel, a peer-to-peer mesh overlay, firewall rules,
//! policy routing and DNS so the machine always ends up in a consistent
//! network state, including after partial failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Networker                             │
//! │          (one mutex, every public call runs to the end)       │
//! │                                                               │
//! │  ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │    VPN    │  │   Mesh    │  │ Allowlist  │  │ Kill      │  │
//! │  │ lifecycle │  │ overlay   │  │ + DNS deny │  │ switch    │  │
//! │  └─────┬─────┘  └─────┬─────┘  └─────┬──────┘  └─────┬─────┘  │
//! └────────│──────────────│──────────────│───────────────│────────┘
//!          ▼              ▼              ▼               ▼
//!   ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌────────────┐
//!   │ Vpn / Mesh │ │ Routers +  │ │  Firewall   │ │ DNS, hosts │
//!   │  engines   │ │  policy    │ │  manager    │ │ IPv6, exit │
//!   └────────────┘ └────────────┘ └─────────────┘ └────────────┘
//! ```
//!
//! Every collaborator is a trait object. [`dryrun`] provides in-memory
//! implementations that record what would have happened to the system.
//!
//! # Features
//!
//! - **Rollback**: a failed start leaves nothing applied
//! - **Kill switch**: blocks traffic independently of the tunnel
//! - **Allowlist**: ports and subnets bypass the tunnel, public subnets
//!   are routed through the cached default gateway
//! - **Mesh**: per-peer inbound, LAN and fileshare rules plus host records
//! - **Network changes**: full tunnel and mesh rebuild without leaking traffic

mod config;
mod device;
mod error;
mod exitnode;
mod ipv6;
mod keys;
mod mesh;
mod networker;
mod tunnel;

pub mod dns;
pub mod dryrun;
pub mod firewall;
pub mod routes;

pub use config::{
    Allowlist, ConfigError, Credentials, NetworkerConfig, PRIVATE_SUBNETS, Ports, Protocol,
    ServerData, Technology, private_subnets,
};
pub use device::{DeviceError, DeviceLister, Interface, SysfsDevices};
pub use error::{Context, NetworkerError};
pub use exitnode::{ExitNode, ExitNodeError};
pub use ipv6::{Ipv6Blocker, Ipv6Error, SysctlIpv6Blocker};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use mesh::{
    DEFAULT_MESH_SUBNET, Mesh, MeshError, MeshMachine, MeshPeer, MeshTopology, PeerStatus,
};
pub use networker::{ConnectionStatus, Networker, NetworkerDeps, NetworkerFlags};
pub use tunnel::{TransferRates, TunnelError, TunnelHandle, TunnelState, Vpn};
