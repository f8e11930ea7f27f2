//! ovnet driver: control plane of a VXLAN overlay network driver.
//!
//! For every overlay network this crate tracks which endpoints exist, which
//! host owns each of them and whether they are attached locally. It keeps
//! that picture in sync across hosts and programs it into the host
//! networking service.
//!
//! # Architecture
//!
//! - **Peer database**: per-network table of `(ip, mac)` to owning host,
//!   with a refresh barrier against bulk replays.
//! - **Registry**: networks, subnets (lazy VXLAN ids) and endpoints, backed
//!   by a local and a global key-value store.
//! - **Dataplane adapter**: builds requests for the host networking service
//!   and the per-network sandbox.
//! - **Membership**: gossip bootstrap, one-time neighbor join and peer event
//!   propagation.
//! - **Driver**: the orchestrator-facing facade, [`OverlayDriver`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ovnet_core::{MemoryStore, OverlayConfig};
//! use ovnet_driver::memory::{GossipHub, MemoryDataplane, MemorySandbox};
//! use ovnet_driver::{Backends, OverlayDriver};
//!
//! # async fn example() -> ovnet_driver::Result<()> {
//! let driver = OverlayDriver::start(
//!     OverlayConfig::default(),
//!     Backends {
//!         dataplane: Arc::new(MemoryDataplane::new("192.168.1.1".parse().unwrap())),
//!         sandbox: Arc::new(MemorySandbox::new()),
//!         gossip: Arc::new(GossipHub::new().member()),
//!         local_store: Some(Arc::new(MemoryStore::new())),
//!         global_store: Some(Arc::new(MemoryStore::new())),
//!         vni_allocator: None,
//!     },
//! )
//! .await?;
//! // ... create networks and endpoints ...
//! driver.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod dataplane;
pub mod driver;
pub mod driverapi;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod network;
pub mod peerdb;
pub mod persist;
pub mod record;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod vni;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use cluster::{ClusterEvent, ClusterState, Gossip};
pub use dataplane::{Dataplane, DataplaneAdapter};
pub use driver::{Backends, NETWORK_TYPE, OverlayDriver};
pub use driverapi::{
    DiscoveryData, EndpointInterface, EventKind, InterfaceInfo, IpamData, JoinInfo, JoinResponse,
    NetworkOptions,
};
pub use error::{DriverError, ErrorKind, Result, Severity};
pub use peerdb::{PeerDb, PeerEntry, PeerKey};
pub use record::{OVERLAY_PEER_TABLE, PeerRecord};
pub use sandbox::Sandbox;
pub use vni::{IdAllocator, SequenceAllocator, VniAllocator};
