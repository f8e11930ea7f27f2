//! Wire records exchanged between hosts.

use std::net::IpAddr;

use ipnet::IpNet;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

use crate::driverapi::EventKind;
use crate::error::{DriverError, Result};

/// Table carrying peer records between hosts.
pub const OVERLAY_PEER_TABLE: &str = "overlay_peer_table";

/// Gossip user-event name for join/leave notifications.
pub const PEER_EVENT_NAME: &str = "jl";

/// One endpoint as advertised to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(rename = "endpointIP")]
    pub endpoint_ip: String,
    #[serde(rename = "endpointMAC")]
    pub endpoint_mac: String,
    #[serde(rename = "tunnelEndpointIP")]
    pub tunnel_endpoint_ip: String,
}

/// A [`PeerRecord`] with every field parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPeer {
    pub addr: IpNet,
    pub mac: MacAddr6,
    pub vtep: IpAddr,
}

impl PeerRecord {
    pub fn new(addr: IpNet, mac: MacAddr6, vtep: IpAddr) -> Self {
        Self {
            endpoint_ip: addr.to_string(),
            endpoint_mac: mac.to_string(),
            tunnel_endpoint_ip: vtep.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DriverError::MalformedPeer(format!("failed to unmarshal peer record: {e}")))
    }

    pub fn parse(&self) -> Result<DecodedPeer> {
        let addr = self.endpoint_ip.parse::<IpNet>().map_err(|_| {
            DriverError::MalformedPeer(format!("invalid peer IP {}", self.endpoint_ip))
        })?;
        let mac = self.endpoint_mac.parse::<MacAddr6>().map_err(|_| {
            DriverError::MalformedPeer(format!("invalid mac {}", self.endpoint_mac))
        })?;
        let vtep = self.tunnel_endpoint_ip.parse::<IpAddr>().map_err(|_| {
            DriverError::MalformedPeer(format!("invalid VTEP {}", self.tunnel_endpoint_ip))
        })?;
        Ok(DecodedPeer { addr, mac, vtep })
    }
}

/// A join or leave notification carried over gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub kind: EventKind,
    pub network_id: String,
    pub endpoint_id: String,
    pub record: PeerRecord,
}

impl PeerEvent {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DriverError::MalformedPeer(format!("failed to unmarshal peer event: {e}")))
    }
}
