//! Types exchanged between the orchestrator and the driver.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use macaddr::MacAddr6;
use ovnet_core::KvStore;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Generic option label carrying the dataplane network name.
pub const NETWORK_NAME_LABEL: &str = "com.ovnet.network.name";
/// Generic option label carrying the host adapter to bind the network to.
pub const INTERFACE_LABEL: &str = "com.ovnet.network.interface";
/// Generic option label carrying a pre-existing dataplane network handle.
pub const HNSID_LABEL: &str = "com.ovnet.network.hnsid";
/// Generic option label carrying a comma separated VXLAN id list.
pub const VXLAN_ID_LIST_LABEL: &str = "com.ovnet.overlay.vxlanid_list";

/// Kind of a table event delivered to or published by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Delete,
}

/// One IPv4 pool assigned to a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpamData {
    pub pool: Ipv4Net,
    pub gateway: Option<Ipv4Net>,
}

impl IpamData {
    pub fn new(pool: Ipv4Net, gateway: Option<Ipv4Net>) -> Self {
        Self { pool, gateway }
    }
}

/// Generic string options passed with CreateNetwork.
///
/// The driver writes the dataplane handle back under [`HNSID_LABEL`] once the
/// network exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub generic: HashMap<String, String>,
}

impl NetworkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: &str, value: impl Into<String>) -> Self {
        self.generic.insert(label.to_string(), value.into());
        self
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.generic.get(label).map(String::as_str)
    }

    /// Parse the VXLAN id list label. An absent or empty label yields no ids.
    pub fn vxlan_ids(&self) -> Result<Vec<u32>> {
        let Some(raw) = self.get(VXLAN_ID_LIST_LABEL) else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',')
            .map(|s| {
                s.trim()
                    .parse::<u32>()
                    .map_err(|_| DriverError::BadRequest(format!("invalid vxlan id value {s:?} passed")))
            })
            .collect()
    }
}

/// The orchestrator's view of an endpoint interface.
pub trait InterfaceInfo: Send {
    fn address(&self) -> Option<IpNet>;
    fn mac_address(&self) -> Option<MacAddr6>;
    /// Report a MAC assigned by the dataplane back to the orchestrator.
    fn set_mac_address(&mut self, mac: MacAddr6) -> Result<()>;
}

/// A plain [`InterfaceInfo`] implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInterface {
    pub address: Option<IpNet>,
    pub mac: Option<MacAddr6>,
}

impl EndpointInterface {
    pub fn new(address: IpNet) -> Self {
        Self {
            address: Some(address),
            mac: None,
        }
    }
}

impl InterfaceInfo for EndpointInterface {
    fn address(&self) -> Option<IpNet> {
        self.address
    }

    fn mac_address(&self) -> Option<MacAddr6> {
        self.mac
    }

    fn set_mac_address(&mut self, mac: MacAddr6) -> Result<()> {
        if self.mac.is_some() {
            return Err(DriverError::Forbidden("endpoint interface mac already set".into()));
        }
        self.mac = Some(mac);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteType {
    Connected,
    NextHop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub destination: Ipv4Net,
    pub route_type: RouteType,
    pub next_hop: Option<IpAddr>,
}

/// A table entry published while joining an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub table: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// Collector the driver fills in during Join.
pub trait JoinInfo: Send {
    fn add_static_route(
        &mut self,
        destination: Ipv4Net,
        route_type: RouteType,
        next_hop: Option<IpAddr>,
    ) -> Result<()>;
    fn add_table_entry(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<()>;
    fn disable_gateway_service(&mut self);
}

/// A plain [`JoinInfo`] that records everything it is given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinResponse {
    pub static_routes: Vec<StaticRoute>,
    pub table_entries: Vec<TableEntry>,
    pub gateway_disabled: bool,
}

impl JoinInfo for JoinResponse {
    fn add_static_route(
        &mut self,
        destination: Ipv4Net,
        route_type: RouteType,
        next_hop: Option<IpAddr>,
    ) -> Result<()> {
        self.static_routes.push(StaticRoute {
            destination,
            route_type,
            next_hop,
        });
        Ok(())
    }

    fn add_table_entry(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.table_entries.push(TableEntry {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn disable_gateway_service(&mut self) {
        self.gateway_disabled = true;
    }
}

/// Discovery notifications delivered through DiscoverNew / DiscoverDelete.
#[derive(Clone)]
pub enum DiscoveryData {
    /// A cluster node, possibly this host itself.
    Node {
        address: IpAddr,
        bind_address: Option<IpAddr>,
        is_self: bool,
    },
    /// A global store became available.
    DatastoreConfig(Arc<dyn KvStore>),
}

impl std::fmt::Debug for DiscoveryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node {
                address,
                bind_address,
                is_self,
            } => f
                .debug_struct("Node")
                .field("address", address)
                .field("bind_address", bind_address)
                .field("is_self", is_self)
                .finish(),
            Self::DatastoreConfig(_) => f.write_str("DatastoreConfig"),
        }
    }
}

/// Reject empty network or endpoint ids.
pub fn validate_id(nid: &str, eid: &str) -> Result<()> {
    if nid.is_empty() {
        return Err(DriverError::BadRequest("invalid network id".into()));
    }
    if eid.is_empty() {
        return Err(DriverError::BadRequest("invalid endpoint id".into()));
    }
    Ok(())
}
