//! VeilNet Portal - host-side packet relay into an overlay network
//!
//! A portal bridges a local TUN interface to an overlay reached through an
//! anchor. It takes over the host network (address, FORWARD rules, NAT, IP
//! forwarding) while keeping a few bootstrap hosts routed around the tunnel,
//! relays frames in both directions, and unwinds all of it on stop.
//!
//! # Modules
//!
//! - [`anchor`] - Anchor interface and the in-process [`MemoryAnchor`]
//! - [`command`] - Execution of `ip`, `iptables` and `sysctl`
//! - [`device`] - Virtual interface (TUN) access
//! - [`error`] - Error types for portal operations
//! - [`forwarding`] - Ingress and egress forwarding loops
//! - [`gateway`] - Host default gateway discovery
//! - [`portal`] - Start/stop lifecycle
//! - [`routes`] - Bypass routes, firewall, NAT and forwarding setup
//! - [`status`] - Status page and metrics endpoint
//!
//! # Example
//!
//! ```ignore
//! use portal_relay::{MemoryAnchor, MemoryAnchorConnector, Portal, PortalSettings, StartParams};
//! use portal_relay::TunDeviceFactory;
//! use std::sync::Arc;
//!
//! let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16")?);
//! let portal = Portal::new(
//!     PortalSettings::default(),
//!     Arc::new(MemoryAnchorConnector::new(anchor)),
//!     Arc::new(TunDeviceFactory),
//! );
//!
//! if let Err(e) = portal.start(&params).await {
//!     portal.stop().await;
//!     return Err(e.into());
//! }
//!
//! tokio::signal::ctrl_c().await?;
//! portal.stop().await;
//! ```

pub mod anchor;
pub mod command;
pub mod device;
pub mod error;
pub mod forwarding;
pub mod gateway;
pub mod portal;
pub mod routes;
pub mod status;

pub use anchor::{
    Anchor, AnchorConnector, AnchorMetrics, AnchorParams, AnchorPeer, MemoryAnchor,
    MemoryAnchorConnector, DEFAULT_PEER_HISTORY,
};
pub use command::{CommandOutput, CommandRunner, RecordingRunner, SystemCommandRunner};
pub use device::{
    DeviceFactory, MemoryDeviceFactory, MemoryInterface, TunDeviceFactory, TunInterface,
    VirtualInterface, WrittenFrame, DEFAULT_INTERFACE_NAME, DEFAULT_MTU,
};
pub use error::{PortalError, Result};
pub use forwarding::{ForwardingPolicy, HEADER_OFFSET};
pub use gateway::{GatewayResolver, HostNetworkContext};
pub use portal::{Portal, PortalSettings, PortalState, StartParams};
pub use routes::{
    AssignedAddress, ForwardDirection, HostResolver, NetResource, RouteConfigurator,
    StaticResolver, SystemResolver, DEFAULT_BYPASS_HOSTS,
};
pub use status::StatusServer;
