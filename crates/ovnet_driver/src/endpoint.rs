use ipnet::IpNet;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Key prefix of endpoint records in the local store.
pub const ENDPOINT_PREFIX: &str = "overlay/endpoint";

/// An endpoint attached to a network on this host, or the shadow of a remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    /// Owning network id.
    pub nid: String,
    /// Dataplane handle.
    pub profile_id: String,
    pub mac: Option<MacAddr6>,
    pub addr: Option<IpNet>,
    /// Local store index, `None` until first written.
    pub db_index: Option<u64>,
}

impl Endpoint {
    pub fn new(id: &str, nid: &str, addr: Option<IpNet>, mac: Option<MacAddr6>) -> Self {
        Self {
            id: id.to_string(),
            nid: nid.to_string(),
            profile_id: String::new(),
            mac,
            addr,
            db_index: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{ENDPOINT_PREFIX}/{}", self.id)
    }
}

/// Persisted form of an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: String,
    pub nid: String,
    #[serde(rename = "profileId", default, skip_serializing_if = "String::is_empty")]
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl From<&Endpoint> for EndpointRecord {
    fn from(ep: &Endpoint) -> Self {
        Self {
            id: ep.id.clone(),
            nid: ep.nid.clone(),
            profile_id: ep.profile_id.clone(),
            addr: ep.addr.map(|a| a.to_string()),
            mac: ep.mac.map(|m| m.to_string()),
        }
    }
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = DriverError;

    fn try_from(record: EndpointRecord) -> Result<Self, Self::Error> {
        let mac = record
            .mac
            .as_deref()
            .map(|m| {
                m.parse::<MacAddr6>().map_err(|_| {
                    DriverError::Internal(format!(
                        "failed to decode endpoint interface mac address {m} for {}",
                        record.id
                    ))
                })
            })
            .transpose()?;
        let addr = record
            .addr
            .as_deref()
            .map(|a| {
                a.parse::<IpNet>().map_err(|e| {
                    DriverError::Internal(format!(
                        "failed to decode endpoint interface address {a} for {}: {e}",
                        record.id
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            id: record.id,
            nid: record.nid,
            profile_id: record.profile_id,
            mac,
            addr,
            db_index: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let ep = Endpoint::new("ep1", "net1", None, None);
        let json = serde_json::to_value(EndpointRecord::from(&ep)).unwrap();
        assert_eq!(json, serde_json::json!({"id": "ep1", "nid": "net1"}));
    }

    #[test]
    fn record_converts_back() {
        let mut ep = Endpoint::new(
            "ep1",
            "net1",
            Some("10.0.1.5/24".parse().unwrap()),
            Some(MacAddr6::new(0x02, 0, 0, 0, 0, 5)),
        );
        ep.profile_id = "hns-ep".into();

        let json = serde_json::to_string(&EndpointRecord::from(&ep)).unwrap();
        assert!(json.contains("\"profileId\":\"hns-ep\""));
        assert!(json.contains("\"addr\":\"10.0.1.5/24\""));

        let record: EndpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(Endpoint::try_from(record).unwrap(), ep);
    }

    #[test]
    fn bad_mac_is_reported() {
        let record = EndpointRecord {
            id: "ep1".into(),
            nid: "net1".into(),
            profile_id: String::new(),
            addr: None,
            mac: Some("not-a-mac".into()),
        };
        let err = Endpoint::try_from(record).unwrap_err();
        assert!(err.to_string().contains("ep1"));
    }

    #[test]
    fn interface_name_in_old_records_is_ignored() {
        let json = r#"{"id":"ep1","nid":"net1","ifName":"eth7","addr":"10.0.1.5/24"}"#;
        let record: EndpointRecord = serde_json::from_str(json).unwrap();
        let ep = Endpoint::try_from(record).unwrap();
        assert_eq!(ep.addr, Some("10.0.1.5/24".parse().unwrap()));
        let back = serde_json::to_value(EndpointRecord::from(&ep)).unwrap();
        assert!(back.get("ifName").is_none());
    }
}
