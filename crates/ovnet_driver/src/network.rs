//! Overlay networks, their subnets and their endpoint tables.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::{DriverError, Result};

/// Key prefix of network records, shared by the global and local stores.
pub const NETWORK_PREFIX: &str = "overlay/network";

pub fn network_key(nid: &str) -> String {
    format!("{NETWORK_PREFIX}/{nid}")
}

// ---------------------------------------------------------------------------
// Subnet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub subnet_ip: Ipv4Net,
    pub gw_ip: Option<Ipv4Net>,
    /// Zero until assigned.
    pub vni: u32,
    /// Sticky failure from the first subnet sandbox join.
    pub init_err: Option<String>,
    pub sandbox_joined: bool,
}

impl Subnet {
    pub fn new(subnet_ip: Ipv4Net, gw_ip: Option<Ipv4Net>, vni: u32) -> Self {
        Self {
            subnet_ip,
            gw_ip,
            vni,
            init_err: None,
            sandbox_joined: false,
        }
    }

    /// Name of the tunnel link carrying this subnet inside the sandbox.
    pub fn vxlan_name(&self, nid: &str) -> String {
        let short: String = nid.chars().take(5).collect();
        format!("vx-{:06x}-{short}", self.vni)
    }
}

/// Persisted form of a [`Subnet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    #[serde(rename = "SubnetIP")]
    pub subnet_ip: String,
    #[serde(rename = "GwIP", default)]
    pub gw_ip: String,
    #[serde(rename = "Vni", default)]
    pub vni: u32,
}

impl From<&Subnet> for SubnetRecord {
    fn from(s: &Subnet) -> Self {
        Self {
            subnet_ip: s.subnet_ip.to_string(),
            gw_ip: s.gw_ip.map(|g| g.to_string()).unwrap_or_default(),
            vni: s.vni,
        }
    }
}

impl TryFrom<&SubnetRecord> for Subnet {
    type Error = DriverError;

    fn try_from(r: &SubnetRecord) -> Result<Self> {
        let subnet_ip = r
            .subnet_ip
            .parse()
            .map_err(|_| DriverError::Internal(format!("invalid stored subnet {}", r.subnet_ip)))?;
        let gw_ip = if r.gw_ip.is_empty() {
            None
        } else {
            Some(
                r.gw_ip
                    .parse()
                    .map_err(|_| DriverError::Internal(format!("invalid stored gateway {}", r.gw_ip)))?,
            )
        };
        Ok(Subnet::new(subnet_ip, gw_ip, r.vni))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Global-store form of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkRecord {
    pub secure: bool,
    pub subnets: Vec<SubnetRecord>,
    pub provider_address: String,
    pub interface_name: String,
    pub hns_id: String,
    pub name: String,
}

impl NetworkRecord {
    /// The VNI stored for `subnet_ip`, if one was assigned.
    pub fn vni_for(&self, subnet_ip: &Ipv4Net) -> Option<u32> {
        self.subnets
            .iter()
            .find(|r| r.subnet_ip.parse::<Ipv4Net>().is_ok_and(|ip| ip.trunc() == subnet_ip.trunc()))
            .map(|r| r.vni)
            .filter(|vni| *vni != 0)
    }

    pub fn vnis(&self) -> impl Iterator<Item = u32> + '_ {
        self.subnets.iter().map(|r| r.vni).filter(|vni| *vni != 0)
    }
}

/// Accepts both the current map form and the legacy bare subnet array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkRecordWire {
    Legacy(Vec<SubnetRecord>),
    Current(NetworkRecord),
}

impl From<NetworkRecordWire> for NetworkRecord {
    fn from(wire: NetworkRecordWire) -> Self {
        match wire {
            NetworkRecordWire::Legacy(subnets) => NetworkRecord {
                subnets,
                ..NetworkRecord::default()
            },
            NetworkRecordWire::Current(record) => record,
        }
    }
}

/// Host-specific network facts kept in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNetworkRecord {
    pub id: String,
    #[serde(rename = "hnsID")]
    pub hns_id: String,
    #[serde(rename = "providerAddress")]
    pub provider_address: String,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct NetworkState {
    name: String,
    hns_id: String,
    provider_address: Option<IpAddr>,
    interface_name: String,
    secure: bool,
    subnets: Vec<Subnet>,
    endpoints: HashMap<String, Endpoint>,
    db_index: Option<u64>,
    sandbox_created: bool,
    sandbox_joins: usize,
}

/// An overlay network. Owns its subnets and endpoint table.
#[derive(Debug)]
pub struct Network {
    id: String,
    state: Mutex<NetworkState>,
    /// Serializes sandbox setup and teardown for this network.
    pub(crate) sandbox_lock: tokio::sync::Mutex<()>,
}

impl Network {
    pub fn new(id: &str, name: &str, interface_name: &str, subnets: Vec<Subnet>) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(NetworkState {
                name: name.to_string(),
                interface_name: interface_name.to_string(),
                subnets,
                ..NetworkState::default()
            }),
            sandbox_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild a network from its global record.
    pub fn from_record(id: &str, record: &NetworkRecord, index: Option<u64>) -> Result<Self> {
        let subnets = record
            .subnets
            .iter()
            .map(Subnet::try_from)
            .collect::<Result<Vec<_>>>()?;
        let name = if record.name.is_empty() {
            id
        } else {
            record.name.as_str()
        };
        let network = Self::new(id, name, &record.interface_name, subnets);
        {
            let mut state = network.state.lock();
            state.secure = record.secure;
            state.hns_id = record.hns_id.clone();
            state.provider_address = parse_provider_address(&record.provider_address, id);
            state.db_index = index;
        }
        Ok(network)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn interface_name(&self) -> String {
        self.state.lock().interface_name.clone()
    }

    pub fn hns_id(&self) -> String {
        self.state.lock().hns_id.clone()
    }

    pub fn provider_address(&self) -> Option<IpAddr> {
        self.state.lock().provider_address
    }

    /// Record the dataplane handle and this host's tunnel address.
    pub fn set_dataplane(&self, hns_id: &str, provider_address: Option<IpAddr>) {
        let mut state = self.state.lock();
        state.hns_id = hns_id.to_string();
        state.provider_address = provider_address;
    }

    pub fn db_index(&self) -> Option<u64> {
        self.state.lock().db_index
    }

    pub fn set_db_index(&self, index: Option<u64>) {
        self.state.lock().db_index = index;
    }

    pub fn to_record(&self) -> NetworkRecord {
        let state = self.state.lock();
        NetworkRecord {
            secure: state.secure,
            subnets: state.subnets.iter().map(SubnetRecord::from).collect(),
            provider_address: state
                .provider_address
                .map(|a| a.to_string())
                .unwrap_or_default(),
            interface_name: state.interface_name.clone(),
            hns_id: state.hns_id.clone(),
            name: state.name.clone(),
        }
    }

    /// Merge VNIs from a freshly read global record into existing subnets.
    pub fn apply_record(&self, record: &NetworkRecord, index: u64) {
        let mut state = self.state.lock();
        for r in &record.subnets {
            let Ok(subnet_ip) = r.subnet_ip.parse::<Ipv4Net>() else {
                warn!("Ignoring invalid stored subnet {} for network {}", r.subnet_ip, self.id);
                continue;
            };
            if r.vni == 0 {
                continue;
            }
            if let Some(s) = matching_subnet_mut(&mut state.subnets, &subnet_ip) {
                s.vni = r.vni;
            }
        }
        state.db_index = Some(index);
    }

    // -- subnets ------------------------------------------------------------

    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().subnets.clone()
    }

    /// The subnet holding `addr`. The prefix length must match exactly, so a
    /// /24 address is never attributed to a wider subnet that contains it.
    pub fn subnet_for_ip(&self, addr: &IpNet) -> Option<Subnet> {
        let IpNet::V4(v4) = addr else {
            return None;
        };
        self.state
            .lock()
            .subnets
            .iter()
            .find(|s| {
                s.subnet_ip.prefix_len() == v4.prefix_len() && s.subnet_ip.contains(&v4.addr())
            })
            .cloned()
    }

    /// The subnet whose network address and prefix equal `subnet_ip`.
    pub fn matching_subnet(&self, subnet_ip: &Ipv4Net) -> Option<Subnet> {
        let mut state = self.state.lock();
        matching_subnet_mut(&mut state.subnets, subnet_ip).cloned()
    }

    pub fn set_vni(&self, subnet_ip: &Ipv4Net, vni: u32) {
        let mut state = self.state.lock();
        if let Some(s) = matching_subnet_mut(&mut state.subnets, subnet_ip) {
            s.vni = vni;
        }
    }

    pub fn vnis(&self) -> Vec<u32> {
        self.state
            .lock()
            .subnets
            .iter()
            .map(|s| s.vni)
            .filter(|v| *v != 0)
            .collect()
    }

    // -- endpoints ----------------------------------------------------------

    pub fn endpoint(&self, eid: &str) -> Option<Endpoint> {
        self.state.lock().endpoints.get(eid).cloned()
    }

    pub fn add_endpoint(&self, ep: Endpoint) {
        self.state.lock().endpoints.insert(ep.id.clone(), ep);
    }

    pub fn remove_endpoint(&self, eid: &str) -> Option<Endpoint> {
        self.state.lock().endpoints.remove(eid)
    }

    pub fn set_endpoint_index(&self, eid: &str, index: u64) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(eid) {
            ep.db_index = Some(index);
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.values().cloned().collect()
    }

    // -- sandbox bookkeeping ------------------------------------------------

    pub fn sandbox_created(&self) -> bool {
        self.state.lock().sandbox_created
    }

    pub(crate) fn mark_sandbox_created(&self) {
        self.state.lock().sandbox_created = true;
    }

    pub(crate) fn inc_sandbox_joins(&self) -> usize {
        let mut state = self.state.lock();
        state.sandbox_joins += 1;
        state.sandbox_joins
    }

    /// Decrement the join count and return what is left.
    pub(crate) fn dec_sandbox_joins(&self) -> usize {
        let mut state = self.state.lock();
        state.sandbox_joins = state.sandbox_joins.saturating_sub(1);
        state.sandbox_joins
    }

    pub fn sandbox_joins(&self) -> usize {
        self.state.lock().sandbox_joins
    }

    /// Take over the endpoints and sandbox bookkeeping of `prev`, the network
    /// this one replaces. Subnet joins survive only where the VNI is unchanged.
    pub(crate) fn carry_over(&self, prev: &Network) {
        let (endpoints, created, joins, subnets) = {
            let p = prev.state.lock();
            (p.endpoints.clone(), p.sandbox_created, p.sandbox_joins, p.subnets.clone())
        };
        let mut state = self.state.lock();
        state.endpoints.extend(endpoints);
        state.sandbox_created = created;
        state.sandbox_joins = joins;
        for old in &subnets {
            if let Some(s) = matching_subnet_mut(&mut state.subnets, &old.subnet_ip) {
                if s.vni == old.vni {
                    s.sandbox_joined = old.sandbox_joined;
                    s.init_err = old.init_err.clone();
                }
            }
        }
    }

    /// Forget the sandbox and every subnet join so the next use rebuilds them.
    pub(crate) fn reset_sandbox(&self) {
        let mut state = self.state.lock();
        state.sandbox_created = false;
        for s in &mut state.subnets {
            s.sandbox_joined = false;
            s.init_err = None;
        }
    }

    pub(crate) fn mark_subnet_joined(&self, subnet_ip: &Ipv4Net, result: std::result::Result<(), String>) {
        let mut state = self.state.lock();
        if let Some(s) = matching_subnet_mut(&mut state.subnets, subnet_ip) {
            match result {
                Ok(()) => s.sandbox_joined = true,
                Err(e) => s.init_err = Some(e),
            }
        }
    }
}

fn matching_subnet_mut<'a>(
    subnets: &'a mut [Subnet],
    subnet_ip: &Ipv4Net,
) -> Option<&'a mut Subnet> {
    subnets.iter_mut().find(|s| {
        s.subnet_ip.prefix_len() == subnet_ip.prefix_len()
            && s.subnet_ip.network() == subnet_ip.network()
    })
}

pub(crate) fn parse_provider_address(raw: &str, nid: &str) -> Option<IpAddr> {
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            warn!("Ignoring invalid provider address {raw} for network {nid}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn subnet_for_ip_requires_equal_prefix() {
        let n = Network::new(
            "net1",
            "net1",
            "",
            vec![
                Subnet::new(net("10.0.0.0/16"), None, 0),
                Subnet::new(net("10.0.1.0/24"), None, 0),
            ],
        );

        let s = n.subnet_for_ip(&"10.0.1.5/24".parse().unwrap()).unwrap();
        assert_eq!(s.subnet_ip, net("10.0.1.0/24"));

        let wide = n.subnet_for_ip(&"10.0.1.5/16".parse().unwrap()).unwrap();
        assert_eq!(wide.subnet_ip, net("10.0.0.0/16"));

        assert!(n.subnet_for_ip(&"10.0.1.5/25".parse().unwrap()).is_none());
        assert!(n.subnet_for_ip(&"fd00::5/64".parse().unwrap()).is_none());
    }

    #[test]
    fn record_uses_wire_names() {
        let n = Network::new(
            "net1",
            "blue",
            "eth0",
            vec![Subnet::new(net("10.0.1.0/24"), Some(net("10.0.1.1/24")), 4097)],
        );
        n.set_dataplane("hns-1", Some("192.168.1.1".parse().unwrap()));

        let json = serde_json::to_value(n.to_record()).unwrap();
        assert_eq!(json["providerAddress"], "192.168.1.1");
        assert_eq!(json["hnsId"], "hns-1");
        assert_eq!(json["interfaceName"], "eth0");
        assert_eq!(json["subnets"][0]["SubnetIP"], "10.0.1.0/24");
        assert_eq!(json["subnets"][0]["GwIP"], "10.0.1.1/24");
        assert_eq!(json["subnets"][0]["Vni"], 4097);
    }

    #[test]
    fn decoder_accepts_legacy_subnet_array() {
        let legacy = r#"[{"SubnetIP":"10.0.1.0/24","GwIP":"10.0.1.1/24","Vni":300}]"#;
        let wire: NetworkRecordWire = serde_json::from_str(legacy).unwrap();
        let record = NetworkRecord::from(wire);
        assert_eq!(record.subnets.len(), 1);
        assert!(record.hns_id.is_empty());

        let current = r#"{"secure":true,"subnets":[{"SubnetIP":"10.0.1.0/24","GwIP":"","Vni":0}],"name":"blue"}"#;
        let record = NetworkRecord::from(serde_json::from_str::<NetworkRecordWire>(current).unwrap());
        assert!(record.secure);
        assert_eq!(record.name, "blue");

        let n = Network::from_record("net1", &record, Some(3)).unwrap();
        assert_eq!(n.subnets()[0].gw_ip, None);
        assert_eq!(n.db_index(), Some(3));
        assert_eq!(n.provider_address(), None);
    }

    #[test]
    fn apply_record_only_takes_assigned_vnis() {
        let n = Network::new(
            "net1",
            "net1",
            "",
            vec![
                Subnet::new(net("10.0.1.0/24"), None, 0),
                Subnet::new(net("10.0.2.0/24"), None, 500),
            ],
        );
        let record = NetworkRecord {
            subnets: vec![
                SubnetRecord {
                    subnet_ip: "10.0.1.0/24".into(),
                    gw_ip: String::new(),
                    vni: 4097,
                },
                SubnetRecord {
                    subnet_ip: "10.0.2.0/24".into(),
                    gw_ip: String::new(),
                    vni: 0,
                },
            ],
            ..NetworkRecord::default()
        };
        n.apply_record(&record, 9);

        let vnis: Vec<u32> = n.subnets().iter().map(|s| s.vni).collect();
        assert_eq!(vnis, vec![4097, 500]);
        assert_eq!(n.db_index(), Some(9));
    }

    #[test]
    fn vxlan_name_is_stable() {
        let s = Subnet::new(net("10.0.1.0/24"), None, 0x1001);
        assert_eq!(s.vxlan_name("abcdef123"), "vx-001001-abcde");
    }

    #[test]
    fn sandbox_bookkeeping() {
        let n = Network::new("net1", "net1", "", vec![Subnet::new(net("10.0.1.0/24"), None, 300)]);
        n.mark_sandbox_created();
        n.mark_subnet_joined(&net("10.0.1.0/24"), Ok(()));
        assert_eq!(n.inc_sandbox_joins(), 1);
        assert_eq!(n.inc_sandbox_joins(), 2);
        assert_eq!(n.dec_sandbox_joins(), 1);

        n.reset_sandbox();
        assert!(!n.sandbox_created());
        assert!(!n.subnets()[0].sandbox_joined);
    }
}
