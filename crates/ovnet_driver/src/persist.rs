//! Typed persistence for networks and endpoints.
//!
//! Network records live in the global store so every host sees the same
//! subnets and VNIs. Endpoints and [`LocalNetworkRecord`]s live in the local
//! store because they describe this host only.

use std::sync::Arc;

use ovnet_core::{DataScope, Datastore, KvStore, StoreError, Versioned};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::endpoint::{ENDPOINT_PREFIX, Endpoint, EndpointRecord};
use crate::error::{DriverError, Result};
use crate::network::{LocalNetworkRecord, Network, NetworkRecord, NetworkRecordWire, network_key};

/// The local and global stores used by the driver.
pub struct Stores {
    local: Option<Datastore>,
    global: RwLock<Option<Datastore>>,
}

impl Stores {
    pub fn new(local: Option<Arc<dyn KvStore>>, global: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            local: local.map(|s| Datastore::new(DataScope::Local, s)),
            global: RwLock::new(global.map(|s| Datastore::new(DataScope::Global, s))),
        }
    }

    pub fn local(&self) -> Option<&Datastore> {
        self.local.as_ref()
    }

    pub fn global(&self) -> Option<Datastore> {
        self.global.read().clone()
    }

    pub fn has_global(&self) -> bool {
        self.global.read().is_some()
    }

    /// Install the global store. Only allowed once.
    pub fn set_global(&self, store: Arc<dyn KvStore>) -> Result<()> {
        let mut global = self.global.write();
        if global.is_some() {
            return Err(DriverError::Forbidden(
                "cannot accept datastore configuration: overlay driver has a datastore configured already"
                    .into(),
            ));
        }
        *global = Some(Datastore::new(DataScope::Global, store));
        info!("Global store configured");
        Ok(())
    }

    fn local_or(&self, what: &str) -> Result<&Datastore> {
        self.local
            .as_ref()
            .ok_or_else(|| DriverError::Internal(format!("overlay local store not initialized, {what}")))
    }

    // -- networks (global) --------------------------------------------------

    /// Write the network's global record using its last known index.
    /// A no-op without a global store.
    pub fn write_network(&self, n: &Network) -> Result<()> {
        let Some(global) = self.global() else {
            debug!("No global store, not persisting network {}", n.id());
            return Ok(());
        };
        let index = global.put_object_atomic(&network_key(n.id()), &n.to_record(), n.db_index())?;
        n.set_db_index(Some(index));
        Ok(())
    }

    /// Read a network's global record. `None` without a global store or when
    /// the record does not exist.
    pub fn get_network(&self, nid: &str) -> Result<Option<Versioned<NetworkRecord>>> {
        let Some(global) = self.global() else {
            return Ok(None);
        };
        match global.get_object::<NetworkRecordWire>(&network_key(nid)) {
            Ok(v) => Ok(Some(Versioned {
                key: v.key,
                value: v.value.into(),
                index: v.index,
            })),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_network(&self, nid: &str) -> Result<()> {
        let Some(global) = self.global() else {
            return Ok(());
        };
        let key = network_key(nid);
        let current = global.get_object::<serde_json::Value>(&key)?;
        global.delete_object_atomic(&key, current.index)?;
        Ok(())
    }

    // -- local networks -----------------------------------------------------

    pub fn get_local_network(&self, nid: &str) -> Result<Option<LocalNetworkRecord>> {
        let local = self.local_or("network not found")?;
        match local.get_object::<LocalNetworkRecord>(&network_key(nid)) {
            Ok(v) => Ok(Some(v.value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_local_network(&self, n: &Network) -> Result<()> {
        let local = self.local_or("network not added")?;
        let key = network_key(n.id());
        let record = LocalNetworkRecord {
            id: n.id().to_string(),
            hns_id: n.hns_id(),
            provider_address: n
                .provider_address()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        };
        let previous = match local.get_object::<serde_json::Value>(&key) {
            Ok(v) => Some(v.index),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        info!("Storing local network record for {}", n.id());
        local.put_object_atomic(&key, &record, previous)?;
        Ok(())
    }

    pub fn delete_local_network(&self, nid: &str) -> Result<()> {
        let local = self.local_or("network not deleted")?;
        let key = network_key(nid);
        let current = local.get_object::<serde_json::Value>(&key)?;
        info!("Deleting local network record for {nid}");
        local.delete_object_atomic(&key, current.index)?;
        Ok(())
    }

    // -- endpoints (local) --------------------------------------------------

    /// Write an endpoint record and return its new index.
    pub fn write_endpoint(&self, ep: &Endpoint) -> Result<u64> {
        let local = self.local_or("ep not added")?;
        Ok(local.put_object_atomic(&ep.key(), &EndpointRecord::from(ep), ep.db_index)?)
    }

    pub fn delete_endpoint(&self, ep: &Endpoint) -> Result<()> {
        let local = self.local_or("ep not deleted")?;
        let index = match ep.db_index {
            Some(index) => index,
            None => local.get_object::<serde_json::Value>(&ep.key())?.index,
        };
        local.delete_object_atomic(&ep.key(), index)?;
        Ok(())
    }

    /// Every persisted endpoint, with its store index. Undecodable records
    /// are logged and skipped.
    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let local = self.local_or("endpoints not listed")?;
        let records = local.list_objects::<EndpointRecord>(&format!("{ENDPOINT_PREFIX}/"))?;

        let mut endpoints = Vec::with_capacity(records.len());
        for v in records {
            match Endpoint::try_from(v.value) {
                Ok(mut ep) => {
                    ep.db_index = Some(v.index);
                    endpoints.push(ep);
                }
                Err(e) => warn!("Skipping stored endpoint {}: {e}", v.key),
            }
        }
        Ok(endpoints)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
