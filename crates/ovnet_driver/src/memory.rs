//! In-process collaborators: a dataplane, a sandbox and a gossip hub that
//! keep everything in memory. Used for single-process deployments and tests.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use macaddr::MacAddr6;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::{ClusterEvent, Gossip};
use crate::dataplane::{
    Dataplane, EndpointRequest, EndpointResponse, NetworkRequest, NetworkResponse,
};
use crate::error::{DriverError, Result};
use crate::sandbox::Sandbox;

// ---------------------------------------------------------------------------
// MemoryDataplane
// ---------------------------------------------------------------------------

/// Dataplane operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateNetwork,
    DeleteNetwork,
    CreateEndpoint,
    DeleteEndpoint,
}

/// Call counters of a [`MemoryDataplane`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataplaneCalls {
    pub create_network: usize,
    pub delete_network: usize,
    pub create_endpoint: usize,
    pub delete_endpoint: usize,
}

#[derive(Debug, Default)]
struct DataplaneState {
    networks: HashMap<String, NetworkRequest>,
    endpoints: HashMap<String, EndpointRequest>,
    calls: DataplaneCalls,
    fail_once: HashSet<FailPoint>,
    next_mac: u32,
}

/// A host networking service that records requests in memory.
///
/// Network creation is idempotent by name and by handle.
#[derive(Debug)]
pub struct MemoryDataplane {
    management_ip: IpAddr,
    state: Mutex<DataplaneState>,
}

impl MemoryDataplane {
    pub fn new(management_ip: IpAddr) -> Self {
        Self {
            management_ip,
            state: Mutex::new(DataplaneState::default()),
        }
    }

    pub fn calls(&self) -> DataplaneCalls {
        self.state.lock().calls
    }

    /// Make the next call of `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().fail_once.insert(point);
    }

    pub fn network(&self, id: &str) -> Option<NetworkRequest> {
        self.state.lock().networks.get(id).cloned()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    pub fn endpoint(&self, id: &str) -> Option<EndpointRequest> {
        self.state.lock().endpoints.get(id).cloned()
    }

    pub fn endpoints(&self) -> Vec<(String, EndpointRequest)> {
        self.state
            .lock()
            .endpoints
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn check(state: &mut DataplaneState, point: FailPoint) -> Result<()> {
        if state.fail_once.remove(&point) {
            return Err(DriverError::Dataplane(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Dataplane for MemoryDataplane {
    async fn create_network(&self, req: &NetworkRequest) -> Result<NetworkResponse> {
        let mut state = self.state.lock();
        state.calls.create_network += 1;
        Self::check(&mut state, FailPoint::CreateNetwork)?;

        let existing = req
            .id
            .as_ref()
            .filter(|id| state.networks.contains_key(*id))
            .cloned()
            .or_else(|| {
                state
                    .networks
                    .iter()
                    .find(|(_, n)| n.name == req.name)
                    .map(|(id, _)| id.clone())
            });
        let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!("Memory dataplane network {id} ({})", req.name);
        state.networks.insert(id.clone(), req.clone());

        Ok(NetworkResponse {
            id,
            management_ip: self.management_ip.to_string(),
        })
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.delete_network += 1;
        Self::check(&mut state, FailPoint::DeleteNetwork)?;
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DriverError::Dataplane(format!("network {id} not found")))
    }

    async fn create_endpoint(&self, req: &EndpointRequest) -> Result<EndpointResponse> {
        let mut state = self.state.lock();
        state.calls.create_endpoint += 1;
        Self::check(&mut state, FailPoint::CreateEndpoint)?;
        if !state.networks.contains_key(&req.virtual_network) {
            return Err(DriverError::Dataplane(format!(
                "virtual network {} not found",
                req.virtual_network
            )));
        }

        let mac = match &req.mac_address {
            Some(mac) => mac.clone(),
            None => {
                state.next_mac += 1;
                let n = state.next_mac.to_be_bytes();
                MacAddr6::new(0x00, 0x15, 0x5d, n[1], n[2], n[3]).to_string()
            }
        };
        let id = Uuid::new_v4().to_string();
        let mut stored = req.clone();
        stored.mac_address = Some(mac.clone());
        state.endpoints.insert(id.clone(), stored);

        Ok(EndpointResponse {
            id,
            mac_address: mac,
        })
    }

    async fn delete_endpoint(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.delete_endpoint += 1;
        Self::check(&mut state, FailPoint::DeleteEndpoint)?;
        state
            .endpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DriverError::Dataplane(format!("endpoint {id} not found")))
    }
}

// ---------------------------------------------------------------------------
// MemorySandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    pub mac: MacAddr6,
    pub link: String,
}

#[derive(Debug, Default)]
struct SandboxState {
    networks: HashSet<String>,
    network_joins: usize,
    subnets: HashMap<String, Vec<(Ipv4Net, u32, String)>>,
    neighbors: HashMap<String, HashMap<IpAddr, Neighbor>>,
    fail_subnet_joins: bool,
}

/// A sandbox that records links and neighbor entries in memory.
#[derive(Debug, Default)]
pub struct MemorySandbox {
    state: Mutex<SandboxState>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_network(&self, nid: &str) -> bool {
        self.state.lock().networks.contains(nid)
    }

    /// Number of times a network sandbox was created.
    pub fn network_joins(&self) -> usize {
        self.state.lock().network_joins
    }

    pub fn subnet_joins(&self, nid: &str) -> usize {
        self.state.lock().subnets.get(nid).map_or(0, Vec::len)
    }

    pub fn neighbor(&self, nid: &str, ip: IpAddr) -> Option<Neighbor> {
        self.state
            .lock()
            .neighbors
            .get(nid)
            .and_then(|m| m.get(&ip))
            .cloned()
    }

    pub fn neighbor_count(&self, nid: &str) -> usize {
        self.state.lock().neighbors.get(nid).map_or(0, HashMap::len)
    }

    pub fn fail_subnet_joins(&self, fail: bool) {
        self.state.lock().fail_subnet_joins = fail;
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn join_network(&self, nid: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.networks.insert(nid.to_string()) {
            state.network_joins += 1;
        }
        Ok(())
    }

    async fn join_subnet(&self, nid: &str, subnet: Ipv4Net, vni: u32, link: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_subnet_joins {
            return Err(DriverError::Sandbox(format!("cannot create link {link}")));
        }
        let subnets = state.subnets.entry(nid.to_string()).or_default();
        if !subnets.iter().any(|(s, _, _)| *s == subnet) {
            subnets.push((subnet, vni, link.to_string()));
        }
        Ok(())
    }

    async fn leave_network(&self, nid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.networks.remove(nid);
        state.subnets.remove(nid);
        state.neighbors.remove(nid);
        Ok(())
    }

    async fn add_neighbor(&self, nid: &str, ip: IpAddr, mac: MacAddr6, link: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.networks.contains(nid) {
            return Err(DriverError::Sandbox(format!("no sandbox for network {nid}")));
        }
        state.neighbors.entry(nid.to_string()).or_default().insert(
            ip,
            Neighbor {
                ip,
                mac,
                link: link.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_neighbor(&self, nid: &str, ip: IpAddr, _mac: MacAddr6) -> Result<()> {
        if let Some(m) = self.state.lock().neighbors.get_mut(nid) {
            m.remove(&ip);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GossipHub
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HubEntry {
    advertise: SocketAddr,
    events: mpsc::UnboundedSender<ClusterEvent>,
    cluster: usize,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: usize,
    members: HashMap<usize, HubEntry>,
}

/// An in-process gossip fabric. Members only see each other's events once
/// one of them has joined the other's cluster.
#[derive(Debug, Clone, Default)]
pub struct GossipHub {
    inner: Arc<Mutex<HubState>>,
}

impl GossipHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self) -> HubMember {
        let mut state = self.inner.lock();
        state.next_id += 1;
        HubMember {
            hub: self.clone(),
            id: state.next_id,
        }
    }

    pub fn started_members(&self) -> usize {
        self.inner.lock().members.len()
    }
}

/// One host's handle on a [`GossipHub`].
#[derive(Debug)]
pub struct HubMember {
    hub: GossipHub,
    id: usize,
}

#[async_trait]
impl Gossip for HubMember {
    async fn start(
        &self,
        _bind: SocketAddr,
        advertise: SocketAddr,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<()> {
        let mut state = self.hub.inner.lock();
        state.members.insert(
            self.id,
            HubEntry {
                advertise,
                events,
                cluster: self.id,
            },
        );
        Ok(())
    }

    async fn join(&self, neighbor: IpAddr) -> Result<usize> {
        let mut state = self.hub.inner.lock();
        let own_cluster = state
            .members
            .get(&self.id)
            .map(|m| m.cluster)
            .ok_or_else(|| DriverError::Cluster("gossip not started".into()))?;
        let target = state
            .members
            .iter()
            .find(|(id, m)| **id != self.id && m.advertise.ip() == neighbor)
            .map(|(_, m)| m.cluster)
            .ok_or_else(|| DriverError::Cluster(format!("no gossip member at {neighbor}")))?;

        for m in state.members.values_mut() {
            if m.cluster == own_cluster {
                m.cluster = target;
            }
        }
        Ok(state.members.values().filter(|m| m.cluster == target).count() - 1)
    }

    async fn broadcast(&self, event: ClusterEvent) -> Result<()> {
        let state = self.hub.inner.lock();
        let cluster = state
            .members
            .get(&self.id)
            .map(|m| m.cluster)
            .ok_or_else(|| DriverError::Cluster("gossip not started".into()))?;
        for (id, m) in &state.members {
            if *id != self.id && m.cluster == cluster {
                // A closed receiver means that member shut down.
                let _ = m.events.send(event.clone());
            }
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.hub.inner.lock().members.remove(&self.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
