//! Network registry.
//!
//! [`Registry`] owns the authoritative table of networks known to this host.
//! It is responsible for:
//! - creating and deleting networks (global record plus dataplane network)
//! - rehydrating networks from the global store on first reference
//! - creating and deleting local endpoints
//! - restoring endpoints from the local store at startup
//! - lazy VXLAN id assignment for subnets

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dataplane::DataplaneAdapter;
use crate::driverapi::{
    HNSID_LABEL, INTERFACE_LABEL, InterfaceInfo, IpamData, NETWORK_NAME_LABEL, NetworkOptions,
    validate_id,
};
use crate::endpoint::Endpoint;
use crate::error::{DriverError, Result, ResultExt};
use crate::network::{Network, Subnet, parse_provider_address};
use crate::peerdb::PeerDb;
use crate::persist::Stores;
use crate::vni::IdAllocator;

const MAX_VNI_RETRIES: usize = 16;

pub struct Registry {
    networks: Mutex<HashMap<String, Arc<Network>>>,
    stores: Arc<Stores>,
    adapter: Arc<DataplaneAdapter>,
    vnis: Arc<dyn IdAllocator>,
}

impl Registry {
    pub fn new(stores: Arc<Stores>, adapter: Arc<DataplaneAdapter>, vnis: Arc<dyn IdAllocator>) -> Self {
        Self {
            networks: Mutex::new(HashMap::new()),
            stores,
            adapter,
            vnis,
        }
    }

    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    /// A network already in memory. Never touches the store.
    pub fn cached(&self, nid: &str) -> Option<Arc<Network>> {
        self.networks.lock().get(nid).cloned()
    }

    // -- networks -----------------------------------------------------------

    /// Create network `nid` over `pools`.
    ///
    /// Calling this again for a network whose dataplane handle is known (from
    /// memory or from the hnsid option) does not create a second dataplane
    /// network. VNIs already assigned to a subnet, its endpoints and its
    /// sandbox state carry over. On success the handle is written back into
    /// `options`.
    pub async fn create_network(
        &self,
        nid: &str,
        pools: &[IpamData],
        options: &mut NetworkOptions,
    ) -> Result<Arc<Network>> {
        if nid.is_empty() {
            return Err(DriverError::BadRequest("invalid network id".into()));
        }
        if pools.is_empty() || pools[0].pool.prefix_len() == 0 {
            return Err(DriverError::BadRequest(format!("ipv4 pool is empty for network {nid}")));
        }

        let supplied = options.vxlan_ids()?;
        if !supplied.is_empty() && supplied.len() != pools.len() {
            return Err(DriverError::BadRequest(format!(
                "network {nid}: {} vxlan ids passed for {} subnets",
                supplied.len(),
                pools.len()
            )));
        }

        let previous = self.cached(nid);
        let stored = self.stores.get_network(nid)?;
        let stored_record = stored.as_ref().map(|v| &v.value);
        let mut held: BTreeSet<u32> = stored_record.map(|r| r.vnis().collect()).unwrap_or_default();
        if let Some(prev) = &previous {
            held.extend(prev.vnis());
        }

        let mut reserved = Vec::new();
        for vni in supplied.iter().filter(|v| !held.contains(*v)) {
            if let Err(e) = self.vnis.reserve(*vni) {
                self.release_vnis(&reserved);
                return Err(e);
            }
            reserved.push(*vni);
        }

        let subnets = pools
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let vni = supplied
                    .get(i)
                    .copied()
                    .or_else(|| {
                        previous
                            .as_ref()
                            .and_then(|prev| prev.matching_subnet(&p.pool))
                            .map(|s| s.vni)
                            .filter(|vni| *vni != 0)
                    })
                    .or_else(|| stored_record.and_then(|r| r.vni_for(&p.pool)))
                    .unwrap_or(0);
                Subnet::new(p.pool, p.gateway, vni)
            })
            .collect();
        let name = options
            .get(NETWORK_NAME_LABEL)
            .filter(|v| !v.is_empty())
            .unwrap_or(nid)
            .to_string();
        let interface = options.get(INTERFACE_LABEL).unwrap_or_default().to_string();
        let n = Arc::new(Network::new(nid, &name, &interface, subnets));

        match options.get(HNSID_LABEL).filter(|v| !v.is_empty()) {
            Some(hns_id) => {
                let pa = self.known_provider_address(nid, hns_id, previous.as_deref());
                n.set_dataplane(hns_id, pa);
            }
            None => {
                if let Some(prev) = previous.as_ref().filter(|p| !p.hns_id().is_empty()) {
                    n.set_dataplane(&prev.hns_id(), prev.provider_address());
                }
            }
        }
        if let Some(prev) = &previous {
            n.carry_over(prev);
        }
        n.set_db_index(stored.as_ref().map(|v| v.index));
        let record_is_new = stored.is_none();

        if let Err(e) = self.stores.write_network(&n) {
            error!("Writing network {nid} to store failed: {e}");
            self.release_vnis(&reserved);
            return Err(e);
        }
        self.networks.lock().insert(nid.to_string(), n.clone());

        if !n.hns_id().is_empty() {
            info!("Network {nid} already has dataplane handle {}, skipping creation", n.hns_id());
            self.release_superseded(&held, &n);
            return Ok(n);
        }

        info!("Creating dataplane network for {nid}");
        let resp = match self.adapter.create_network(&n, false).await {
            Ok(resp) => resp,
            Err(e) => {
                error!("Dataplane network create for {nid} failed: {e}");
                self.unwind_create(nid, previous, record_is_new, &reserved);
                return Err(e);
            }
        };
        n.set_dataplane(&resp.id, parse_provider_address(&resp.management_ip, nid));

        info!(
            "Writing network {nid} to store again with provider address {}",
            resp.management_ip
        );
        if let Err(e) = self.stores.write_network(&n) {
            error!("Writing network {nid} after dataplane create failed: {e}");
            self.adapter
                .delete_network(&resp.id)
                .await
                .best_effort("dataplane network cleanup");
            self.unwind_create(nid, previous, record_is_new, &reserved);
            return Err(e);
        }
        options.generic.insert(HNSID_LABEL.to_string(), resp.id.clone());
        if self.stores.local().is_some() {
            self.stores.write_local_network(&n).best_effort("local network record");
        }
        self.release_superseded(&held, &n);
        Ok(n)
    }

    /// Undo a failed create: put the replaced network back, drop a record
    /// this call introduced and hand back the ids it reserved.
    fn unwind_create(
        &self,
        nid: &str,
        previous: Option<Arc<Network>>,
        record_is_new: bool,
        reserved: &[u32],
    ) {
        {
            let mut networks = self.networks.lock();
            match previous {
                Some(prev) => {
                    networks.insert(nid.to_string(), prev);
                }
                None => {
                    networks.remove(nid);
                }
            }
        }
        if record_is_new {
            self.stores.delete_network(nid).best_effort("network record cleanup");
        }
        self.release_vnis(reserved);
    }

    /// Release ids the network held before a re-create but no longer uses.
    fn release_superseded(&self, held: &BTreeSet<u32>, n: &Network) {
        let kept = n.vnis();
        let stale: Vec<u32> = held.iter().copied().filter(|v| !kept.contains(v)).collect();
        self.release_vnis(&stale);
    }

    fn release_vnis(&self, ids: &[u32]) {
        for vni in ids {
            self.vnis.release(*vni).best_effort("vxlan id release");
        }
    }

    /// Provider address for a handle supplied by the orchestrator, from memory
    /// or the local network record.
    fn known_provider_address(&self, nid: &str, hns_id: &str, previous: Option<&Network>) -> Option<IpAddr> {
        if let Some(prev) = previous.filter(|p| p.hns_id() == hns_id) {
            return prev.provider_address();
        }
        if self.stores.local().is_none() {
            return None;
        }
        match self.stores.get_local_network(nid) {
            Ok(Some(ln)) if ln.hns_id == hns_id => parse_provider_address(&ln.provider_address, nid),
            Ok(_) => None,
            Err(e) => {
                warn!("Reading local network record for {nid} failed: {e}");
                None
            }
        }
    }

    /// Delete network `nid`. The dataplane network goes first; if that fails
    /// the network stays registered.
    pub async fn delete_network(&self, nid: &str) -> Result<Arc<Network>> {
        if nid.is_empty() {
            return Err(DriverError::BadRequest("invalid network id".into()));
        }
        let n = self
            .network(nid)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("could not find network with id {nid}")))?;

        info!("Deleting dataplane network {} for {nid}", n.hns_id());
        self.adapter.delete_network(&n.hns_id()).await?;
        self.networks.lock().remove(nid);

        if self.stores.local().is_some() {
            self.stores
                .delete_local_network(nid)
                .best_effort("local network record delete");
        }
        self.stores.delete_network(nid).best_effort("network record delete");
        for vni in n.vnis() {
            self.vnis.release(vni).best_effort("vxlan id release");
        }
        Ok(n)
    }

    /// Look a network up, loading it from the global store on first
    /// reference. A loaded network is registered with this host's dataplane
    /// before it is cached.
    pub async fn network(&self, nid: &str) -> Result<Option<Arc<Network>>> {
        if let Some(n) = self.cached(nid) {
            return Ok(Some(n));
        }
        let Some(record) = self.stores.get_network(nid)? else {
            return Ok(None);
        };
        debug!("Loading network {nid} from the global store");
        let n = Arc::new(Network::from_record(nid, &record.value, Some(record.index))?);
        self.attach_dataplane(&n).await?;

        let mut networks = self.networks.lock();
        Ok(Some(networks.entry(nid.to_string()).or_insert(n).clone()))
    }

    /// Like [`network`](Self::network) but unknown ids are an error.
    pub async fn require(&self, nid: &str) -> Result<Arc<Network>> {
        self.network(nid)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("network id {nid:?} not found")))
    }

    /// Find this host's dataplane network for a loaded network, creating it
    /// when no local record exists.
    async fn attach_dataplane(&self, n: &Network) -> Result<()> {
        let nid = n.id();
        let local = if self.stores.local().is_some() {
            self.stores.get_local_network(nid)?
        } else {
            None
        };
        if let Some(ln) = local {
            info!("Local network record found for {nid}");
            n.set_dataplane(&ln.hns_id, parse_provider_address(&ln.provider_address, nid));
            return Ok(());
        }

        if n.hns_id().is_empty() {
            info!("No local network record for {nid}, creating dataplane network");
        } else {
            info!(
                "No local network record for {nid}, creating dataplane network again (stored handle {})",
                n.hns_id()
            );
        }
        let resp = self.adapter.create_network(n, false).await?;
        n.set_dataplane(&resp.id, parse_provider_address(&resp.management_ip, nid));
        if self.stores.local().is_some() {
            self.stores.write_local_network(n)?;
        }
        Ok(())
    }

    // -- vxlan ids ----------------------------------------------------------

    /// Make sure the subnet `subnet_ip` of `n` has a VNI.
    ///
    /// The global record is re-read before allocating so an id assigned by
    /// another host wins. A lost write race releases the id and retries.
    pub fn obtain_vxlan_id(&self, n: &Network, subnet_ip: &Ipv4Net) -> Result<u32> {
        let nid = n.id();
        let missing = || DriverError::NotFound(format!("subnet {subnet_ip} in network {nid}"));
        let current = n.matching_subnet(subnet_ip).ok_or_else(missing)?;
        if current.vni != 0 {
            return Ok(current.vni);
        }

        for attempt in 0..MAX_VNI_RETRIES {
            if let Some(record) = self.stores.get_network(nid)? {
                n.apply_record(&record.value, record.index);
            }
            let current = n.matching_subnet(subnet_ip).ok_or_else(missing)?;
            if current.vni != 0 {
                return Ok(current.vni);
            }

            let vni = self.vnis.next()?;
            n.set_vni(subnet_ip, vni);
            match self.stores.write_network(n) {
                Ok(()) => {
                    info!("Assigned vxlan id {vni} to subnet {subnet_ip} in network {nid}");
                    return Ok(vni);
                }
                Err(e) => {
                    self.vnis.release(vni).best_effort("vxlan id release");
                    n.set_vni(subnet_ip, 0);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    debug!("Network {nid} changed while assigning vxlan id, retrying (attempt {attempt})");
                }
            }
        }
        Err(DriverError::Internal(format!(
            "could not assign vxlan id to subnet {subnet_ip} in network {nid}"
        )))
    }

    // -- endpoints ----------------------------------------------------------

    /// Create the local endpoint `eid`. A MAC assigned by the dataplane is
    /// reported back through `iface`.
    pub async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        iface: &mut dyn InterfaceInfo,
    ) -> Result<Endpoint> {
        validate_id(nid, eid)?;
        let n = self.require(nid).await?;
        if n.endpoint(eid).is_some() {
            return Err(DriverError::Forbidden(format!(
                "endpoint {eid} already exists in network {nid}"
            )));
        }

        let addr = iface.address().ok_or_else(|| {
            DriverError::BadRequest(format!("create endpoint {eid} was not passed interface IP address"))
        })?;
        if n.subnet_for_ip(&addr).is_none() {
            return Err(DriverError::BadRequest(format!(
                "no matching subnet for IP {addr} in network {nid}"
            )));
        }
        let pa = n
            .provider_address()
            .ok_or_else(|| DriverError::Internal(format!("network {nid} has no provider address")))?;

        let requested = iface.mac_address();
        let (profile_id, mac) = self
            .adapter
            .create_endpoint(&n.hns_id(), addr.addr(), requested, true, pa)
            .await?;
        if requested.is_none() {
            if let Err(e) = iface.set_mac_address(mac) {
                self.adapter
                    .delete_endpoint(&profile_id)
                    .await
                    .best_effort("endpoint cleanup");
                return Err(e);
            }
        }

        let mut ep = Endpoint::new(eid, nid, Some(addr), Some(mac));
        ep.profile_id = profile_id;
        n.add_endpoint(ep.clone());

        match self.stores.write_endpoint(&ep) {
            Ok(index) => {
                n.set_endpoint_index(eid, index);
                ep.db_index = Some(index);
            }
            Err(e) => {
                error!("Failed to write overlay endpoint {eid} to local store: {e}");
                return Err(e);
            }
        }
        info!("Created endpoint {eid} ({addr}, {mac}) in network {nid}");
        Ok(ep)
    }

    /// Delete endpoint `eid`. A local store failure is only logged; a
    /// dataplane failure is returned.
    pub async fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<Endpoint> {
        validate_id(nid, eid)?;
        let n = self.require(nid).await?;
        let ep = n
            .endpoint(eid)
            .ok_or_else(|| DriverError::NotFound(format!("endpoint id {eid:?} not found")))?;

        n.remove_endpoint(eid);
        if let Err(e) = self.stores.delete_endpoint(&ep) {
            warn!("Failed to delete overlay endpoint {eid} from local store: {e}");
        }
        self.adapter.delete_endpoint(&ep.profile_id).await?;
        Ok(ep)
    }

    /// Reload persisted endpoints. Endpoints whose network cannot be resolved
    /// are purged from the local store; the rest are re-registered with their
    /// network and added to `peers` as local entries.
    pub async fn restore_endpoints(&self, peers: &PeerDb) -> Result<usize> {
        if self.stores.local().is_none() {
            warn!("Cannot restore overlay endpoints because the local store is missing");
            return Ok(0);
        }
        let endpoints = self.stores.list_endpoints()?;
        if endpoints.is_empty() {
            info!("No overlay endpoints to restore");
            return Ok(0);
        }

        let mut restored = 0;
        for ep in endpoints {
            let n = match self.network(&ep.nid).await {
                Ok(Some(n)) => n,
                Ok(None) => {
                    debug!("Network {} not found for restored endpoint {}", ep.nid, ep.id);
                    self.purge_endpoint(&ep);
                    continue;
                }
                Err(e) => {
                    warn!("Network {} for restored endpoint {} failed to load: {e}", ep.nid, ep.id);
                    self.purge_endpoint(&ep);
                    continue;
                }
            };

            info!("Restoring endpoint {} in network {}", ep.id, ep.nid);
            n.add_endpoint(ep.clone());
            match (ep.addr, ep.mac, n.provider_address()) {
                (Some(addr), Some(mac), Some(pa)) => {
                    peers
                        .add(&ep.nid, &ep.id, addr.addr(), addr.prefix_len(), mac, pa, true)
                        .await;
                }
                _ => warn!("Restored endpoint {} is incomplete, not adding it to the peer db", ep.id),
            }
            restored += 1;
        }
        info!("Restored {restored} overlay endpoints");
        Ok(restored)
    }

    fn purge_endpoint(&self, ep: &Endpoint) {
        debug!("Deleting stale overlay endpoint {} from store", ep.id);
        if let Err(e) = self.stores.delete_endpoint(ep) {
            debug!("Failed to delete stale overlay endpoint {} from store: {e}", ep.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driverapi::{EndpointInterface, VXLAN_ID_LIST_LABEL};
    use crate::memory::{FailPoint, MemoryDataplane, MemorySandbox};
    use crate::vni::{SequenceAllocator, VniAllocator};
    use crate::network::NETWORK_PREFIX;
    use ovnet_core::{KvPair, KvStore, MemoryStore, StoreError};

    /// Global store whose network record writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        network_writes_left: Mutex<Option<usize>>,
    }

    impl FlakyStore {
        fn fail_network_writes_after(&self, allowed: usize) {
            *self.network_writes_left.lock() = Some(allowed);
        }

        fn heal(&self) {
            *self.network_writes_left.lock() = None;
        }
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &str) -> std::result::Result<KvPair, StoreError> {
            self.inner.get(key)
        }

        fn put_atomic(
            &self,
            key: &str,
            value: Vec<u8>,
            previous: Option<u64>,
        ) -> std::result::Result<u64, StoreError> {
            if key.starts_with(NETWORK_PREFIX) {
                if let Some(left) = self.network_writes_left.lock().as_mut() {
                    if *left == 0 {
                        return Err(StoreError::Backend("disk full".into()));
                    }
                    *left -= 1;
                }
            }
            self.inner.put_atomic(key, value, previous)
        }

        fn delete_atomic(&self, key: &str, previous: u64) -> std::result::Result<(), StoreError> {
            self.inner.delete_atomic(key, previous)
        }

        fn list(&self, prefix: &str) -> std::result::Result<Vec<KvPair>, StoreError> {
            self.inner.list(prefix)
        }
    }

    struct Fixture {
        registry: Registry,
        dataplane: Arc<MemoryDataplane>,
        local: Arc<MemoryStore>,
        global: Arc<FlakyStore>,
    }

    fn fixture_with(vnis: Option<Arc<dyn IdAllocator>>) -> Fixture {
        let local = Arc::new(MemoryStore::new());
        let global = Arc::new(FlakyStore::default());
        let stores = Arc::new(Stores::new(Some(local.clone()), Some(global.clone())));
        let dataplane = Arc::new(MemoryDataplane::new("192.168.1.1".parse().unwrap()));
        let adapter = Arc::new(DataplaneAdapter::new(
            dataplane.clone(),
            Arc::new(MemorySandbox::new()),
            "overlay",
        ));
        let vnis = vnis.unwrap_or_else(|| Arc::new(VniAllocator::new(256, 1000, stores.clone())));
        Fixture {
            registry: Registry::new(stores, adapter, vnis),
            dataplane,
            local,
            global,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn pools(cidrs: &[&str]) -> Vec<IpamData> {
        cidrs
            .iter()
            .map(|c| {
                let pool: Ipv4Net = c.parse().unwrap();
                let gw = Ipv4Net::new(pool.hosts().next().unwrap(), pool.prefix_len()).unwrap();
                IpamData::new(pool, Some(gw))
            })
            .collect()
    }

    #[tokio::test]
    async fn create_network_registers_and_learns_provider_address() {
        let f = fixture();
        let mut opts = NetworkOptions::new().with(NETWORK_NAME_LABEL, "blue");
        let n = f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();

        assert_eq!(n.name(), "blue");
        assert_eq!(n.provider_address(), Some("192.168.1.1".parse().unwrap()));
        assert_eq!(opts.get(HNSID_LABEL), Some(n.hns_id().as_str()));
        assert!(f.global.get("overlay/network/net1").is_ok());
        assert!(f.local.get("overlay/network/net1").is_ok());

        // Second call sees the handle and skips the dataplane.
        f.registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();
        assert_eq!(f.dataplane.calls().create_network, 1);
    }

    #[tokio::test]
    async fn create_network_rejects_bad_input() {
        let f = fixture();
        let mut opts = NetworkOptions::new();
        let err = f.registry.create_network("net1", &[], &mut opts).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);

        let err = f
            .registry
            .create_network("net1", &pools(&["0.0.0.0/0"]), &mut opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ipv4 pool is empty"));

        let mut partial = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        let err = f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24", "10.0.2.0/24"]), &mut partial)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        assert!(f.registry.cached("net1").is_none());
    }

    #[tokio::test]
    async fn failed_dataplane_create_is_compensated() {
        let f = fixture();
        f.dataplane.fail_next(FailPoint::CreateNetwork);
        let mut opts = NetworkOptions::new();
        assert!(f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .is_err());
        assert!(f.registry.cached("net1").is_none());
        assert!(f.global.get("overlay/network/net1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failed_dataplane_delete_keeps_network() {
        let f = fixture();
        let mut opts = NetworkOptions::new();
        f.registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();

        f.dataplane.fail_next(FailPoint::DeleteNetwork);
        assert!(f.registry.delete_network("net1").await.is_err());
        assert!(f.registry.cached("net1").is_some());

        f.registry.delete_network("net1").await.unwrap();
        assert!(f.registry.cached("net1").is_none());
        assert!(f.registry.network("net1").await.unwrap().is_none());
        assert!(f.registry.delete_network("net1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn lazy_vni_is_assigned_once_and_persisted() {
        let f = fixture_with(Some(Arc::new(SequenceAllocator::new([4097, 4098]))));
        let mut opts = NetworkOptions::new();
        let n = f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();

        assert_eq!(f.registry.obtain_vxlan_id(&n, &subnet).unwrap(), 4097);
        assert_eq!(f.registry.obtain_vxlan_id(&n, &subnet).unwrap(), 4097);

        let stored = f.registry.stores().get_network("net1").unwrap().unwrap();
        assert_eq!(stored.value.subnets[0].vni, 4097);
    }

    #[tokio::test]
    async fn recreate_keeps_assigned_vni_and_sandbox_state() {
        let f = fixture();
        let mut opts = NetworkOptions::new();
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let n = f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();
        let first = f.registry.obtain_vxlan_id(&n, &subnet).unwrap();
        n.mark_sandbox_created();
        n.inc_sandbox_joins();
        n.mark_subnet_joined(&subnet, Ok(()));

        let again = f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();
        let stored = f.registry.stores().get_network("net1").unwrap().unwrap();
        assert_eq!(stored.value.subnets[0].vni, first);
        assert_eq!(f.registry.obtain_vxlan_id(&again, &subnet).unwrap(), first);

        assert!(again.sandbox_created());
        assert_eq!(again.sandbox_joins(), 1);
        assert!(again.matching_subnet(&subnet).unwrap().sandbox_joined);
        assert_eq!(f.dataplane.calls().create_network, 1);
    }

    #[tokio::test]
    async fn explicit_vni_is_exclusive_to_one_network() {
        let f = fixture();
        let mut opts = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        f.registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();
        // The owner may repeat itself.
        f.registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();

        let mut other = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        let err = f
            .registry
            .create_network("net2", &pools(&["10.0.2.0/24"]), &mut other)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
        assert!(f.registry.cached("net2").is_none());
    }

    #[tokio::test]
    async fn failed_record_write_releases_reserved_vnis() {
        let f = fixture();
        f.global.fail_network_writes_after(0);
        let mut opts = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        assert!(f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .is_err());
        assert!(f.registry.cached("net1").is_none());
        assert_eq!(f.dataplane.calls().create_network, 0);

        f.global.heal();
        let mut reuse = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        f.registry
            .create_network("net2", &pools(&["10.0.2.0/24"]), &mut reuse)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_second_write_removes_dataplane_network() {
        let f = fixture();
        f.global.fail_network_writes_after(1);
        let mut opts = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        assert!(f
            .registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .is_err());

        assert_eq!(f.dataplane.calls().create_network, 1);
        assert_eq!(f.dataplane.calls().delete_network, 1);
        assert_eq!(f.dataplane.network_count(), 0);
        assert!(f.registry.cached("net1").is_none());
        assert!(f.global.get("overlay/network/net1").unwrap_err().is_not_found());
        assert!(opts.get(HNSID_LABEL).is_none());

        f.global.heal();
        let mut reuse = NetworkOptions::new().with(VXLAN_ID_LIST_LABEL, "300");
        f.registry
            .create_network("net2", &pools(&["10.0.2.0/24"]), &mut reuse)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn endpoint_lifecycle() {
        let f = fixture();
        let mut opts = NetworkOptions::new();
        f.registry
            .create_network("net1", &pools(&["10.0.1.0/24"]), &mut opts)
            .await
            .unwrap();

        let mut outside = EndpointInterface::new("10.9.0.5/24".parse().unwrap());
        let err = f
            .registry
            .create_endpoint("net1", "ep0", &mut outside)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no matching subnet"));

        let mut iface = EndpointInterface::new("10.0.1.5/24".parse().unwrap());
        let ep = f.registry.create_endpoint("net1", "ep1", &mut iface).await.unwrap();
        assert_eq!(iface.mac, ep.mac);
        assert!(f.local.get("overlay/endpoint/ep1").is_ok());

        f.registry.delete_endpoint("net1", "ep1").await.unwrap();
        assert!(f.local.get("overlay/endpoint/ep1").unwrap_err().is_not_found());
        assert_eq!(f.dataplane.calls().delete_endpoint, 1);
        assert!(f.registry.delete_endpoint("net1", "ep1").await.unwrap_err().is_not_found());
    }
}
