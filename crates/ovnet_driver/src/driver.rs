//! OverlayDriver: the facade the orchestrator talks to.
//!
//! [`OverlayDriver`] wires the registry, the peer database, the dataplane
//! adapter and cluster membership together and runs one background task
//! that:
//! - publishes local join/leave notifications over gossip
//! - applies peer events received from other hosts
//! - replays remote peers into a freshly created sandbox
//! - leaves the cluster on shutdown

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use ipnet::IpNet;
use ovnet_core::{KvStore, OverlayConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterEvent, ClusterState, Gossip, Membership};
use crate::dataplane::{Dataplane, DataplaneAdapter};
use crate::driverapi::{
    DiscoveryData, EventKind, InterfaceInfo, IpamData, JoinInfo, NetworkOptions, RouteType,
    validate_id,
};
use crate::endpoint::Endpoint;
use crate::error::{DriverError, Result, ResultExt};
use crate::network::Network;
use crate::peerdb::PeerDb;
use crate::persist::Stores;
use crate::record::{DecodedPeer, OVERLAY_PEER_TABLE, PEER_EVENT_NAME, PeerEvent, PeerRecord};
use crate::registry::Registry;
use crate::router::{TableEvent, TableHandler, TableRouter};
use crate::sandbox::Sandbox;
use crate::vni::{IdAllocator, VniAllocator};

/// Driver type reported to the orchestrator.
pub const NETWORK_TYPE: &str = "overlay";

/// External collaborators the driver runs against.
pub struct Backends {
    pub dataplane: Arc<dyn Dataplane>,
    pub sandbox: Arc<dyn Sandbox>,
    pub gossip: Arc<dyn Gossip>,
    /// Host-only facts: endpoints and local network records.
    pub local_store: Option<Arc<dyn KvStore>>,
    /// Cluster-shared network records. Can also arrive later through
    /// [`DiscoveryData::DatastoreConfig`].
    pub global_store: Option<Arc<dyn KvStore>>,
    /// Overrides the store-backed VXLAN id allocator.
    pub vni_allocator: Option<Arc<dyn IdAllocator>>,
}

/// Work for the background task.
enum Notify {
    /// Publish a local endpoint join or leave.
    Endpoint {
        kind: EventKind,
        network: Arc<Network>,
        endpoint: Endpoint,
    },
    /// Replay remote peers of a network into its sandbox.
    Refresh(String),
}

// ---------------------------------------------------------------------------
// Overlay (shared state)
// ---------------------------------------------------------------------------

struct Overlay {
    config: OverlayConfig,
    registry: Registry,
    peers: PeerDb,
    adapter: Arc<DataplaneAdapter>,
    membership: Membership,
    notify_tx: mpsc::UnboundedSender<Notify>,
}

impl Overlay {
    fn request_refresh(&self, nid: &str) {
        if self.notify_tx.send(Notify::Refresh(nid.to_string())).is_err() {
            warn!("Driver loop stopped, not refreshing network {nid}");
        }
    }

    // -- peer programming ---------------------------------------------------

    /// Learn a remote peer. With `update_db` a shadow dataplane endpoint is
    /// registered and the peer database updated before the neighbor entry
    /// is installed.
    async fn add_peer(&self, n: &Network, eid: &str, peer: DecodedPeer, update_db: bool) -> Result<()> {
        validate_id(n.id(), eid)?;
        info!("Adding peer {} ({}) via {} to network {}", peer.addr, peer.mac, peer.vtep, n.id());

        if update_db {
            let ip = peer.addr.addr();
            let existing = n.endpoint(eid);
            let same = existing.as_ref().is_some_and(|ep| {
                ep.mac == Some(peer.mac) && ep.addr.map(|a| a.addr()) == Some(ip)
            });

            if same {
                debug!("Shadow endpoint {eid} already present in network {}", n.id());
            } else {
                if let Some(old) = existing {
                    self.adapter
                        .delete_endpoint(&old.profile_id)
                        .await
                        .best_effort("stale shadow endpoint delete");
                    if let (Some(addr), Some(mac)) = (old.addr, old.mac) {
                        self.peers.delete(n.id(), addr.addr(), mac).await;
                    }
                }
                let (profile_id, _) = self
                    .adapter
                    .create_endpoint(&n.hns_id(), ip, Some(peer.mac), false, peer.vtep)
                    .await?;
                let host = IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 })
                    .map_err(|e| DriverError::Internal(format!("host prefix for {ip}: {e}")))?;
                let mut ep = Endpoint::new(eid, n.id(), Some(host), Some(peer.mac));
                ep.profile_id = profile_id;
                info!("Shadow endpoint {eid} created with dataplane id {}", ep.profile_id);
                n.add_endpoint(ep);
            }

            self.peers
                .add(n.id(), eid, ip, peer.addr.prefix_len(), peer.mac, peer.vtep, false)
                .await;
        }

        self.program_neighbor(n, peer).await
    }

    /// Install the neighbor entry for `peer` on its subnet's tunnel link.
    async fn program_neighbor(&self, n: &Network, peer: DecodedPeer) -> Result<()> {
        if self.adapter.join_sandbox(n).await? {
            self.request_refresh(n.id());
        }

        let subnet = n.subnet_for_ip(&peer.addr).ok_or_else(|| {
            DriverError::NotFound(format!("couldn't find the subnet {} in network {}", peer.addr, n.id()))
        })?;
        self.registry.obtain_vxlan_id(n, &subnet.subnet_ip)?;
        self.adapter.join_subnet_sandbox(n, &subnet.subnet_ip).await?;

        let link = n
            .matching_subnet(&subnet.subnet_ip)
            .map(|s| s.vxlan_name(n.id()))
            .unwrap_or_default();
        self.adapter
            .add_neighbor(n.id(), peer.addr.addr(), peer.mac, &link)
            .await
    }

    /// Forget a remote peer.
    async fn delete_peer(&self, n: &Network, eid: &str, peer: DecodedPeer, update_db: bool) -> Result<()> {
        validate_id(n.id(), eid)?;
        info!("Deleting peer {} ({}) from network {}", peer.addr, peer.mac, n.id());

        let ep = n
            .endpoint(eid)
            .ok_or_else(|| DriverError::NotFound(format!("could not find endpoint with id {eid}")))?;

        if update_db {
            self.adapter.delete_endpoint(&ep.profile_id).await?;
            self.peers.delete(n.id(), peer.addr.addr(), peer.mac).await;
            n.remove_endpoint(eid);
        }

        if !n.sandbox_created() {
            return Ok(());
        }
        self.adapter.delete_neighbor(n.id(), peer.addr.addr(), peer.mac).await
    }

    /// Re-install every remote peer of `nid`. Point mutations on the network
    /// wait until the replay is done.
    async fn refresh_dataplane(&self, nid: &str) {
        let Some(n) = self.registry.cached(nid) else {
            return;
        };
        let Some(refresh) = self.peers.begin_refresh(nid).await else {
            return;
        };
        debug!("Refreshing {} remote peers in network {nid}", refresh.peers.len());

        for (key, entry) in &refresh.peers {
            let addr = match IpNet::new(key.ip, entry.prefix_len) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Peer {key} in network {nid} has a bad prefix: {e}");
                    continue;
                }
            };
            let peer = DecodedPeer {
                addr,
                mac: key.mac,
                vtep: entry.vtep,
            };
            if let Err(e) = self.program_neighbor(&n, peer).await {
                warn!("Peer refresh in sandbox failed for ip {} and mac {}: {e}", key.ip, key.mac);
            }
        }
    }

    // -- incoming events ----------------------------------------------------

    /// Table notification for the peer table. Undecodable values are logged
    /// and dropped.
    async fn handle_peer_table(&self, kind: EventKind, nid: &str, eid: &str, value: &[u8]) {
        match PeerRecord::decode(value) {
            Ok(record) => self.apply_peer_record(kind, nid, eid, &record).await,
            Err(e) => error!("{e}"),
        }
    }

    async fn handle_cluster_event(&self, event: ClusterEvent) {
        if event.name != PEER_EVENT_NAME {
            debug!("Ignoring cluster event {}", event.name);
            return;
        }
        match PeerEvent::decode(&event.payload) {
            Ok(pe) => {
                self.apply_peer_record(pe.kind, &pe.network_id, &pe.endpoint_id, &pe.record)
                    .await
            }
            Err(e) => error!("{e}"),
        }
    }

    /// Apply a remote peer fact to network `nid`. Records describing this
    /// host are ignored; bad ones are logged and dropped.
    async fn apply_peer_record(&self, kind: EventKind, nid: &str, eid: &str, record: &PeerRecord) {
        let n = match self.registry.network(nid).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                debug!("Peer event for unknown network {nid} ignored");
                return;
            }
            Err(e) => {
                warn!("Peer event for network {nid} ignored: {e}");
                return;
            }
        };

        let peer = match record.parse() {
            Ok(peer) => peer,
            Err(e) => {
                error!("{e} received in event notify for network {nid}");
                return;
            }
        };
        if is_own_vtep(n.provider_address(), peer.vtep) {
            return;
        }

        let result = match kind {
            EventKind::Delete => self.delete_peer(&n, eid, peer, true).await,
            EventKind::Add => self.add_peer(&n, eid, peer, true).await,
        };
        if let Err(e) = result {
            error!("Peer {kind:?} for endpoint {eid} in network {nid} failed: {e}");
        }
    }

    // -- outgoing events ----------------------------------------------------

    fn push_local_endpoint_event(&self, kind: EventKind, nid: &str, eid: &str) {
        let Some(n) = self.registry.cached(nid) else {
            debug!("Error pushing local endpoint event for network {nid}");
            return;
        };
        let Some(ep) = n.endpoint(eid) else {
            debug!("Error pushing local endpoint event for ep {nid} / {eid}");
            return;
        };
        if !self.membership.is_alive() {
            return;
        }
        let msg = Notify::Endpoint {
            kind,
            network: n,
            endpoint: ep,
        };
        if self.notify_tx.send(msg).is_err() {
            warn!("Driver loop stopped, dropping {kind:?} notification for {eid}");
        }
    }

    /// Announce every local endpoint, after joining a cluster.
    fn push_local_db(&self) {
        let mut local = Vec::new();
        let _ = self.peers.walk(|nid, _key, entry| {
            if entry.is_local {
                local.push((nid.to_string(), entry.endpoint_id));
            }
            ControlFlow::Continue(())
        });
        info!("Pushing {} local endpoints to the cluster", local.len());
        for (nid, eid) in local {
            self.push_local_endpoint_event(EventKind::Add, &nid, &eid);
        }
    }

    async fn publish(&self, kind: EventKind, n: &Network, ep: &Endpoint) {
        let (Some(addr), Some(mac), Some(vtep)) = (ep.addr, ep.mac, n.provider_address()) else {
            warn!("Endpoint {} in network {} is incomplete, not published", ep.id, n.id());
            return;
        };
        let event = PeerEvent {
            kind,
            network_id: n.id().to_string(),
            endpoint_id: ep.id.clone(),
            record: PeerRecord::new(addr, mac, vtep),
        };
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Encoding peer event for {} failed: {e}", ep.id);
                return;
            }
        };
        let result = self
            .membership
            .broadcast(ClusterEvent {
                name: PEER_EVENT_NAME.to_string(),
                payload,
            })
            .await;
        if let Err(e) = result {
            warn!("Broadcasting {kind:?} for endpoint {} failed: {e}", ep.id);
        }
    }

    // -- membership ---------------------------------------------------------

    async fn node_join(&self, address: IpAddr, bind: Option<IpAddr>, is_self: bool) {
        if is_self && !self.membership.is_alive() {
            let bind = bind
                .or(self.config.bind_address)
                .unwrap_or(address);
            let start_gossip = self.registry.stores().has_global();
            if let Err(e) = self.membership.bootstrap_self(address, bind, start_gossip).await {
                error!("{e}");
                return;
            }
        }
        if !is_self {
            self.membership.set_neighbor(address);
        }

        match self.membership.try_join().await {
            Ok(true) => self.push_local_db(),
            Ok(false) => {}
            Err(e) => error!("Joining gossip neighbor {address} failed: {e}"),
        }
    }
}

/// True when `vtep` is this host's provider address, whatever textual form
/// the remote used for it.
fn is_own_vtep(own: Option<IpAddr>, vtep: IpAddr) -> bool {
    own.is_some_and(|own| own.to_canonical() == vtep.to_canonical())
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

async fn run_loop(
    overlay: Arc<Overlay>,
    mut notify_rx: mpsc::UnboundedReceiver<Notify>,
    mut events_rx: mpsc::UnboundedReceiver<ClusterEvent>,
    mut exit_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    info!("Overlay driver loop started");
    loop {
        tokio::select! {
            Some(msg) = notify_rx.recv() => match msg {
                Notify::Endpoint { kind, network, endpoint } => {
                    overlay.publish(kind, &network, &endpoint).await;
                }
                Notify::Refresh(nid) => overlay.refresh_dataplane(&nid).await,
            },
            Some(event) = events_rx.recv() => overlay.handle_cluster_event(event).await,
            ack = exit_rx.recv() => {
                overlay.membership.leave().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
        }
    }
    info!("Overlay driver loop stopped");
}

// ---------------------------------------------------------------------------
// OverlayDriver
// ---------------------------------------------------------------------------

pub struct OverlayDriver {
    overlay: Arc<Overlay>,
    router: TableRouter,
    exit_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl OverlayDriver {
    /// Build the driver, restore persisted endpoints and start the background
    /// loop. Gossip starts once this host is discovered, and only if a
    /// global store is configured.
    pub async fn start(config: OverlayConfig, backends: Backends) -> Result<Self> {
        let stores = Arc::new(Stores::new(backends.local_store, backends.global_store));
        let vnis = backends.vni_allocator.unwrap_or_else(|| {
            Arc::new(VniAllocator::new(
                config.vxlan_id_start,
                config.vxlan_id_end,
                stores.clone(),
            ))
        });
        let adapter = Arc::new(DataplaneAdapter::new(
            backends.dataplane,
            backends.sandbox,
            NETWORK_TYPE,
        ));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::channel(1);

        let overlay = Arc::new(Overlay {
            membership: Membership::new(backends.gossip, config.gossip_port, events_tx),
            registry: Registry::new(stores, adapter.clone(), vnis),
            peers: PeerDb::new(),
            adapter,
            notify_tx,
            config,
        });

        if let Err(e) = overlay.registry.restore_endpoints(&overlay.peers).await {
            error!("Restoring overlay endpoints failed: {e}");
        }

        let mut router = TableRouter::new();
        router.register(OVERLAY_PEER_TABLE, peer_table_handler(overlay.clone()))?;

        tokio::spawn(run_loop(overlay.clone(), notify_rx, events_rx, exit_rx));

        let driver = Self {
            overlay,
            router,
            exit_tx,
        };
        if let Some(advertise) = driver.overlay.config.advertise_address {
            driver.overlay.node_join(advertise, None, true).await;
        }
        Ok(driver)
    }

    pub fn network_type(&self) -> &'static str {
        NETWORK_TYPE
    }

    pub fn cluster_state(&self) -> ClusterState {
        self.overlay.membership.state()
    }

    pub fn peers(&self) -> &PeerDb {
        &self.overlay.peers
    }

    /// Look a network up, loading it from the global store if needed.
    pub async fn network(&self, nid: &str) -> Result<Option<Arc<Network>>> {
        self.overlay.registry.network(nid).await
    }

    // -- networks -----------------------------------------------------------

    pub async fn create_network(
        &self,
        nid: &str,
        options: &mut NetworkOptions,
        ipv4: &[IpamData],
    ) -> Result<()> {
        info!("Create network {nid}");
        self.overlay.registry.create_network(nid, ipv4, options).await?;
        Ok(())
    }

    pub async fn delete_network(&self, nid: &str) -> Result<()> {
        info!("Delete network {nid}");
        let n = self.overlay.registry.delete_network(nid).await?;
        self.overlay.peers.remove_network(nid);
        self.overlay.adapter.release_sandbox(&n).await;
        Ok(())
    }

    // -- endpoints ----------------------------------------------------------

    pub async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        iface: &mut dyn InterfaceInfo,
    ) -> Result<()> {
        info!("Create endpoint {eid} in network {nid}");
        self.overlay.registry.create_endpoint(nid, eid, iface).await?;
        Ok(())
    }

    pub async fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<()> {
        info!("Delete endpoint {eid} in network {nid}");
        let ep = self.overlay.registry.delete_endpoint(nid, eid).await?;
        if let (Some(addr), Some(mac)) = (ep.addr, ep.mac) {
            self.overlay.peers.delete(nid, addr.addr(), mac).await;
        }
        Ok(())
    }

    /// Operational data for an endpoint: its dataplane handle.
    pub async fn endpoint_oper_info(&self, nid: &str, eid: &str) -> Result<HashMap<String, String>> {
        validate_id(nid, eid)?;
        let n = self.overlay.registry.require(nid).await?;
        let ep = n
            .endpoint(eid)
            .ok_or_else(|| DriverError::NotFound(format!("endpoint id {eid:?} not found")))?;
        Ok(HashMap::from([("hnsid".to_string(), ep.profile_id)]))
    }

    // -- join / leave -------------------------------------------------------

    /// Attach endpoint `eid` to its sandbox and announce it.
    pub async fn join(&self, nid: &str, eid: &str, jinfo: &mut dyn JoinInfo) -> Result<()> {
        validate_id(nid, eid)?;
        let overlay = &self.overlay;
        let n = overlay
            .registry
            .network(nid)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("could not find network with id {nid}")))?;
        let ep = n
            .endpoint(eid)
            .ok_or_else(|| DriverError::NotFound(format!("could not find endpoint with id {eid}")))?;
        let (Some(addr), Some(mac)) = (ep.addr, ep.mac) else {
            return Err(DriverError::Internal(format!("endpoint {eid} has no address or mac")));
        };
        let s = n
            .subnet_for_ip(&addr)
            .ok_or_else(|| DriverError::NotFound(format!("could not find subnet for endpoint {eid}")))?;
        let pa = n
            .provider_address()
            .ok_or_else(|| DriverError::Internal(format!("network {nid} has no provider address")))?;

        overlay.registry.obtain_vxlan_id(&n, &s.subnet_ip).map_err(|e| {
            error!("Couldn't get vxlan id for {}: {e}", s.subnet_ip);
            e
        })?;
        if overlay.adapter.join_sandbox(&n).await? {
            overlay.request_refresh(nid);
        }
        overlay.adapter.join_subnet_sandbox(&n, &s.subnet_ip).await?;
        n.inc_sandbox_joins();

        let index = overlay.registry.stores().write_endpoint(&ep)?;
        n.set_endpoint_index(eid, index);

        let next_hop = s.gw_ip.map(|g| IpAddr::V4(g.addr()));
        for sub in n.subnets() {
            if sub.subnet_ip == s.subnet_ip {
                continue;
            }
            if let Err(e) = jinfo.add_static_route(sub.subnet_ip, RouteType::NextHop, next_hop) {
                error!("Adding subnet {} static route in network {nid} failed: {e}", sub.subnet_ip);
            }
        }

        overlay
            .peers
            .add(nid, eid, addr.addr(), addr.prefix_len(), mac, pa, true)
            .await;

        let record = PeerRecord::new(addr, mac, pa).encode()?;
        if let Err(e) = jinfo.add_table_entry(OVERLAY_PEER_TABLE, eid, record) {
            error!("Failed adding table entry to join info for {eid}: {e}");
        }
        jinfo.disable_gateway_service();

        overlay.push_local_endpoint_event(EventKind::Add, nid, eid);
        info!("Endpoint {eid} joined network {nid}");
        Ok(())
    }

    /// Detach endpoint `eid` from its sandbox. An unknown endpoint yields a
    /// maskable error.
    pub async fn leave(&self, nid: &str, eid: &str) -> Result<()> {
        validate_id(nid, eid)?;
        let n = self
            .overlay
            .registry
            .network(nid)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("could not find network with id {nid}")))?;
        if n.endpoint(eid).is_none() {
            return Err(DriverError::Maskable(format!("could not find endpoint with id {eid}")));
        }

        self.overlay.push_local_endpoint_event(EventKind::Delete, nid, eid);
        self.overlay.adapter.leave_sandbox(&n).await;
        info!("Endpoint {eid} left network {nid}");
        Ok(())
    }

    // -- events and discovery -----------------------------------------------

    /// Table notification from the orchestrator.
    pub async fn event_notify(&self, kind: EventKind, nid: &str, table: &str, key: &str, value: &[u8]) {
        self.router
            .dispatch(TableEvent {
                kind,
                network_id: nid.to_string(),
                table: table.to_string(),
                key: key.to_string(),
                value: value.to_vec(),
            })
            .await;
    }

    pub async fn discover_new(&self, data: DiscoveryData) -> Result<()> {
        info!("Discover new: {data:?}");
        match data {
            DiscoveryData::Node {
                address,
                bind_address,
                is_self,
            } => {
                self.overlay.node_join(address, bind_address, is_self).await;
                Ok(())
            }
            DiscoveryData::DatastoreConfig(store) => self.overlay.registry.stores().set_global(store),
        }
    }

    pub async fn discover_delete(&self, data: DiscoveryData) -> Result<()> {
        debug!("Discover delete: {data:?}");
        Ok(())
    }

    /// Stop the background loop after it has left the cluster.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.exit_tx.send(ack_tx).await.is_err() {
            return;
        }
        if ack_rx.await.is_err() {
            warn!("Driver loop exited without acknowledging shutdown");
        }
    }
}

fn peer_table_handler(overlay: Arc<Overlay>) -> TableHandler {
    Arc::new(move |event: TableEvent| {
        let overlay = overlay.clone();
        Box::pin(async move {
            overlay
                .handle_peer_table(event.kind, &event.network_id, &event.key, &event.value)
                .await;
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
