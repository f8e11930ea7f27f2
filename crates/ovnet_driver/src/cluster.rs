//! Cluster membership: self bootstrap, one-time neighbor join and the event
//! channel fed by the gossip transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{DriverError, Result};

/// Membership progress of this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterState {
    Uninitialized,
    SelfValidated,
    GossipStarted,
    NeighborKnown,
    Joined,
}

/// A user event carried by the gossip transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub name: String,
    pub payload: Vec<u8>,
}

/// The gossip transport.
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Start the local gossip instance. Events from other members are sent to
    /// `events`.
    async fn start(
        &self,
        bind: SocketAddr,
        advertise: SocketAddr,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<()>;

    /// Join the cluster through `neighbor`. Returns the number of members
    /// contacted.
    async fn join(&self, neighbor: IpAddr) -> Result<usize>;

    async fn broadcast(&self, event: ClusterEvent) -> Result<()>;

    async fn leave(&self) -> Result<()>;
}

/// Check that `addr` belongs to this host by binding a socket to it.
pub async fn validate_self(addr: IpAddr) -> Result<()> {
    if addr.is_unspecified() || addr.is_multicast() {
        return Err(DriverError::Cluster(format!("invalid self address ({addr})")));
    }
    tokio::net::UdpSocket::bind((addr, 0)).await.map_err(|e| {
        DriverError::Cluster(format!(
            "multi-host overlay networking requires cluster-advertise({addr}) to be configured \
             with a local ip-address that is reachable within the cluster: {e}"
        ))
    })?;
    Ok(())
}

#[derive(Debug)]
struct MembershipState {
    state: ClusterState,
    neighbor: Option<IpAddr>,
    joined_at: Option<DateTime<Utc>>,
}

pub struct Membership {
    gossip: Arc<dyn Gossip>,
    gossip_port: u16,
    events: mpsc::UnboundedSender<ClusterEvent>,
    state: Mutex<MembershipState>,
    join_latch: AtomicBool,
}

impl Membership {
    pub fn new(
        gossip: Arc<dyn Gossip>,
        gossip_port: u16,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Self {
        Self {
            gossip,
            gossip_port,
            events,
            state: Mutex::new(MembershipState {
                state: ClusterState::Uninitialized,
                neighbor: None,
                joined_at: None,
            }),
            join_latch: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ClusterState {
        self.state.lock().state
    }

    /// True once the gossip instance is running.
    pub fn is_alive(&self) -> bool {
        self.state() >= ClusterState::GossipStarted
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().joined_at
    }

    /// Validate this host's address and, when a cluster store exists, start
    /// gossip on it.
    pub async fn bootstrap_self(
        &self,
        advertise: IpAddr,
        bind: IpAddr,
        start_gossip: bool,
    ) -> Result<()> {
        validate_self(advertise).await?;
        {
            let mut st = self.state.lock();
            if st.state < ClusterState::SelfValidated {
                st.state = ClusterState::SelfValidated;
            }
        }
        info!("Node advertise/bind address set to {advertise} / {bind}");

        if !start_gossip {
            info!("No cluster store, gossip not started");
            return Ok(());
        }

        self.gossip
            .start(
                SocketAddr::new(bind, self.gossip_port),
                SocketAddr::new(advertise, self.gossip_port),
                self.events.clone(),
            )
            .await?;

        let mut st = self.state.lock();
        st.state = if st.neighbor.is_some() {
            ClusterState::NeighborKnown
        } else {
            ClusterState::GossipStarted
        };
        info!("Gossip started on {bind}:{}", self.gossip_port);
        Ok(())
    }

    pub fn set_neighbor(&self, neighbor: IpAddr) {
        let mut st = self.state.lock();
        st.neighbor = Some(neighbor);
        if st.state == ClusterState::GossipStarted {
            st.state = ClusterState::NeighborKnown;
        }
    }

    /// Join through the known neighbor at most once per process. Returns true
    /// only for the call that performed the join. A failed join resets the
    /// latch so a later trigger can retry.
    pub async fn try_join(&self) -> Result<bool> {
        let neighbor = {
            let st = self.state.lock();
            match (st.state >= ClusterState::GossipStarted, st.neighbor) {
                (true, Some(neighbor)) => neighbor,
                _ => return Ok(false),
            }
        };
        if self.join_latch.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        match self.gossip.join(neighbor).await {
            Ok(contacted) => {
                let mut st = self.state.lock();
                st.state = ClusterState::Joined;
                st.joined_at = Some(Utc::now());
                info!("Joined cluster through {neighbor} ({contacted} members contacted)");
                Ok(true)
            }
            Err(e) => {
                self.join_latch.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn broadcast(&self, event: ClusterEvent) -> Result<()> {
        self.gossip.broadcast(event).await
    }

    pub async fn leave(&self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.gossip.leave().await {
            warn!("Failed leaving the cluster: {e}");
        }
        self.state.lock().state = ClusterState::SelfValidated;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
