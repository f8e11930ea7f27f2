//! Dataplane adapter.
//!
//! Translates registry and peer state into requests against the host
//! networking service and the sandbox. Every descriptor is built in full
//! before the call is issued. Failures are returned as-is; callers own any
//! compensation.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result, ResultExt};
use crate::network::Network;
use crate::sandbox::Sandbox;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Policy {
    /// Binds a subnet to its VXLAN id.
    #[serde(rename = "VSID")]
    Vsid {
        #[serde(rename = "VSID")]
        vsid: u32,
    },
    /// Tunnel endpoint (provider address) of the host owning an endpoint.
    #[serde(rename = "PA")]
    ProviderAddress {
        #[serde(rename = "PA")]
        pa: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubnetRequest {
    pub address_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "Type")]
    pub network_type: String,
    pub subnets: Vec<SubnetRequest>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_adapter_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkResponse {
    pub id: String,
    #[serde(rename = "ManagementIP")]
    pub management_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointRequest {
    pub virtual_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: IpAddr,
    pub is_local_endpoint: bool,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointResponse {
    pub id: String,
    pub mac_address: String,
}

/// The external host networking service.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn create_network(&self, req: &NetworkRequest) -> Result<NetworkResponse>;
    async fn delete_network(&self, id: &str) -> Result<()>;
    async fn create_endpoint(&self, req: &EndpointRequest) -> Result<EndpointResponse>;
    async fn delete_endpoint(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct DataplaneAdapter {
    dataplane: Arc<dyn Dataplane>,
    sandbox: Arc<dyn Sandbox>,
    network_type: String,
}

impl DataplaneAdapter {
    pub fn new(dataplane: Arc<dyn Dataplane>, sandbox: Arc<dyn Sandbox>, network_type: &str) -> Self {
        Self {
            dataplane,
            sandbox,
            network_type: network_type.to_string(),
        }
    }

    /// Describe `n` and its subnets for the dataplane. `with_id` carries the
    /// known handle so the service can match an existing network.
    pub fn network_request(&self, n: &Network, with_id: bool) -> NetworkRequest {
        let subnets = n
            .subnets()
            .iter()
            .map(|s| SubnetRequest {
                address_prefix: s.subnet_ip.to_string(),
                gateway_address: s.gw_ip.map(|g| g.addr().to_string()),
                policies: vec![Policy::Vsid { vsid: s.vni }],
            })
            .collect();
        let hns_id = n.hns_id();
        NetworkRequest {
            id: (with_id && !hns_id.is_empty()).then_some(hns_id),
            name: n.name(),
            network_type: self.network_type.clone(),
            subnets,
            network_adapter_name: n.interface_name(),
        }
    }

    pub async fn create_network(&self, n: &Network, with_id: bool) -> Result<NetworkResponse> {
        let req = self.network_request(n, with_id);
        info!("Dataplane network request = {}", serde_json::to_string(&req)?);
        self.dataplane.create_network(&req).await
    }

    pub async fn delete_network(&self, hns_id: &str) -> Result<()> {
        info!("Dataplane network delete for {hns_id}");
        self.dataplane.delete_network(hns_id).await
    }

    /// Create a dataplane endpoint tunnelled through `pa`.
    pub async fn create_endpoint(
        &self,
        hns_id: &str,
        ip: IpAddr,
        mac: Option<MacAddr6>,
        is_local: bool,
        pa: IpAddr,
    ) -> Result<(String, MacAddr6)> {
        let req = EndpointRequest {
            virtual_network: hns_id.to_string(),
            mac_address: mac.map(|m| m.to_string()),
            ip_address: ip,
            is_local_endpoint: is_local,
            policies: vec![Policy::ProviderAddress { pa: pa.to_string() }],
        };
        info!("Dataplane endpoint request = {}", serde_json::to_string(&req)?);
        let resp = self.dataplane.create_endpoint(&req).await?;

        let assigned = match mac {
            Some(mac) => mac,
            None => resp.mac_address.parse::<MacAddr6>().map_err(|_| {
                DriverError::Dataplane(format!(
                    "endpoint {} returned invalid mac {:?}",
                    resp.id, resp.mac_address
                ))
            })?,
        };
        Ok((resp.id, assigned))
    }

    pub async fn delete_endpoint(&self, profile_id: &str) -> Result<()> {
        info!("Dataplane endpoint delete for {profile_id}");
        self.dataplane.delete_endpoint(profile_id).await
    }

    // -- sandbox ------------------------------------------------------------

    /// Make sure the network sandbox exists. Returns true when this call
    /// created it, in which case remote peers must be replayed.
    pub async fn join_sandbox(&self, n: &Network) -> Result<bool> {
        let _guard = n.sandbox_lock.lock().await;
        if n.sandbox_created() {
            return Ok(false);
        }
        self.sandbox.join_network(n.id()).await?;
        n.mark_sandbox_created();
        debug!("Sandbox created for network {}", n.id());
        Ok(true)
    }

    /// Bring up the tunnel link for `subnet_ip`. A failure is remembered and
    /// returned on every later attempt until the sandbox is rebuilt.
    pub async fn join_subnet_sandbox(&self, n: &Network, subnet_ip: &Ipv4Net) -> Result<()> {
        let _guard = n.sandbox_lock.lock().await;
        let subnet = n
            .matching_subnet(subnet_ip)
            .ok_or_else(|| DriverError::NotFound(format!("subnet {subnet_ip} in network {}", n.id())))?;
        if subnet.sandbox_joined {
            return Ok(());
        }
        if let Some(e) = subnet.init_err {
            return Err(DriverError::Sandbox(e));
        }

        let link = subnet.vxlan_name(n.id());
        let result = self
            .sandbox
            .join_subnet(n.id(), subnet.subnet_ip, subnet.vni, &link)
            .await;
        n.mark_subnet_joined(subnet_ip, result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        result
    }

    /// Drop one sandbox reference. The last one tears the sandbox down.
    pub async fn leave_sandbox(&self, n: &Network) {
        let _guard = n.sandbox_lock.lock().await;
        if n.dec_sandbox_joins() > 0 || !n.sandbox_created() {
            return;
        }
        self.sandbox
            .leave_network(n.id())
            .await
            .best_effort("sandbox leave");
        n.reset_sandbox();
        info!("Sandbox released for network {}", n.id());
    }

    /// Tear the sandbox down whatever the join count.
    pub async fn release_sandbox(&self, n: &Network) {
        let _guard = n.sandbox_lock.lock().await;
        if !n.sandbox_created() {
            return;
        }
        self.sandbox
            .leave_network(n.id())
            .await
            .best_effort("sandbox leave");
        n.reset_sandbox();
    }

    pub async fn add_neighbor(&self, nid: &str, ip: IpAddr, mac: MacAddr6, link: &str) -> Result<()> {
        self.sandbox
            .add_neighbor(nid, ip, mac, link)
            .await
            .map_err(|e| DriverError::Sandbox(format!("could not add neighbor entry into the sandbox: {e}")))
    }

    pub async fn delete_neighbor(&self, nid: &str, ip: IpAddr, mac: MacAddr6) -> Result<()> {
        if let Err(e) = self.sandbox.delete_neighbor(nid, ip, mac).await {
            warn!("Neighbor delete for {ip} in network {nid} failed: {e}");
            return Err(DriverError::Sandbox(format!(
                "could not delete neighbor entry from the sandbox: {e}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
