//! Peer database: per-network table of every known endpoint.
//!
//! The outer index maps network id to a [`PeerMap`]. Each map has its own
//! mutex, so work on different networks never contends. Entries are keyed by
//! the string form of [`PeerKey`] and parsed back on every walk.
//!
//! Each map also carries a refresh barrier. Point mutations hold a shared
//! token while they write; a bulk dataplane refresh holds the exclusive token
//! for its whole replay, so a single add or delete can never interleave with
//! it.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;

use macaddr::MacAddr6;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

/// Identity of a peer interface, independent of the endpoint object that
/// represents it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub ip: IpAddr,
    pub mac: MacAddr6,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ip, self.mac)
    }
}

impl FromStr for PeerKey {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(ip), Some(mac), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(DriverError::Internal(format!("malformed peer key {s:?}")));
        };
        let ip = ip
            .parse()
            .map_err(|_| DriverError::Internal(format!("bad peer ip in key {s:?}")))?;
        let mac = mac
            .parse()
            .map_err(|_| DriverError::Internal(format!("bad peer mac in key {s:?}")))?;
        Ok(Self { ip, mac })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub endpoint_id: String,
    pub vtep: IpAddr,
    pub prefix_len: u8,
    pub is_local: bool,
}

#[derive(Debug, Default)]
struct PeerMap {
    entries: Mutex<HashMap<String, PeerEntry>>,
    refresh: Arc<RwLock<()>>,
}

/// Exclusive refresh token for one network plus the remote peers to replay.
///
/// Point mutations on the network block until this is dropped.
pub struct RefreshGuard {
    _token: OwnedRwLockWriteGuard<()>,
    pub peers: Vec<(PeerKey, PeerEntry)>,
}

#[derive(Debug, Default)]
pub struct PeerDb {
    networks: Mutex<HashMap<String, Arc<PeerMap>>>,
}

impl PeerDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, nid: &str) -> Option<Arc<PeerMap>> {
        self.networks.lock().get(nid).cloned()
    }

    fn map_or_create(&self, nid: &str) -> Arc<PeerMap> {
        self.networks
            .lock()
            .entry(nid.to_string())
            .or_default()
            .clone()
    }

    /// Insert or overwrite the entry for `(ip, mac)` in network `nid`.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        nid: &str,
        eid: &str,
        ip: IpAddr,
        prefix_len: u8,
        mac: MacAddr6,
        vtep: IpAddr,
        is_local: bool,
    ) {
        let map = self.map_or_create(nid);
        let _shared = map.refresh.read().await;

        let key = PeerKey { ip, mac };
        debug!("peerdb add {key} in network {nid} (local: {is_local})");
        map.entries.lock().insert(
            key.to_string(),
            PeerEntry {
                endpoint_id: eid.to_string(),
                vtep,
                prefix_len,
                is_local,
            },
        );
    }

    /// Remove the entry for `(ip, mac)` if present.
    pub async fn delete(&self, nid: &str, ip: IpAddr, mac: MacAddr6) {
        let Some(map) = self.map(nid) else {
            return;
        };
        let _shared = map.refresh.read().await;

        let key = PeerKey { ip, mac };
        if map.entries.lock().remove(&key.to_string()).is_some() {
            debug!("peerdb delete {key} in network {nid}");
        }
    }

    /// Point lookup by peer IP. Returns `(mac, prefix_len, vtep)`.
    pub fn search(&self, nid: &str, ip: IpAddr) -> Result<(MacAddr6, u8, IpAddr)> {
        let mut found = None;
        let _ = self.walk_network(nid, |key, entry| {
            if key.ip == ip {
                found = Some((key.mac, entry.prefix_len, entry.vtep));
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found.ok_or_else(|| DriverError::NotFound(format!("peer ip {ip} not found in peerdb")))
    }

    /// Visit every entry of every network. The visitor receives copies.
    pub fn walk<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&str, PeerKey, PeerEntry) -> ControlFlow<()>,
    {
        let nids: Vec<String> = self.networks.lock().keys().cloned().collect();
        for nid in nids {
            self.walk_network(&nid, |key, entry| visitor(&nid, key, entry))?;
        }
        ControlFlow::Continue(())
    }

    /// Visit every entry of one network. Keys that fail to parse are logged
    /// and skipped.
    pub fn walk_network<F>(&self, nid: &str, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(PeerKey, PeerEntry) -> ControlFlow<()>,
    {
        let Some(map) = self.map(nid) else {
            return ControlFlow::Continue(());
        };
        let snapshot: Vec<(String, PeerEntry)> = map
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (raw, entry) in snapshot {
            match raw.parse::<PeerKey>() {
                Ok(key) => visitor(key, entry)?,
                Err(e) => warn!("Peer key scan on network {nid} failed: {e}"),
            }
        }
        ControlFlow::Continue(())
    }

    /// Take the exclusive refresh token for `nid` and snapshot its remote
    /// peers. Returns `None` when the network has no entries.
    pub async fn begin_refresh(&self, nid: &str) -> Option<RefreshGuard> {
        let map = self.map(nid)?;
        let token = map.refresh.clone().write_owned().await;

        let mut peers = Vec::new();
        let snapshot: Vec<(String, PeerEntry)> = map
            .entries
            .lock()
            .iter()
            .filter(|(_, v)| !v.is_local)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (raw, entry) in snapshot {
            match raw.parse::<PeerKey>() {
                Ok(key) => peers.push((key, entry)),
                Err(e) => warn!("Peer key scan on network {nid} failed: {e}"),
            }
        }

        Some(RefreshGuard {
            _token: token,
            peers,
        })
    }

    /// Drop every entry for a deleted network.
    pub fn remove_network(&self, nid: &str) {
        self.networks.lock().remove(nid);
    }

    /// Number of entries in one network.
    pub fn len(&self, nid: &str) -> usize {
        self.map(nid).map_or(0, |m| m.entries.lock().len())
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, nid: &str, raw_key: &str, entry: PeerEntry) {
        self.map_or_create(nid)
            .entries
            .lock()
            .insert(raw_key.to_string(), entry);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mac(last: u8) -> MacAddr6 {
        MacAddr6::new(0xaa, 0xbb, 0xcc, 0, 0, last)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn peer_key_string_roundtrip() {
        let key = PeerKey {
            ip: ip("10.0.1.5"),
            mac: mac(5),
        };
        let parsed: PeerKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("10.0.1.5".parse::<PeerKey>().is_err());
        assert!("10.0.1.5 nope".parse::<PeerKey>().is_err());
    }

    #[tokio::test]
    async fn add_twice_leaves_one_entry() {
        let db = PeerDb::new();
        for _ in 0..2 {
            db.add("net1", "ep1", ip("10.0.1.5"), 24, mac(5), ip("192.168.1.2"), false)
                .await;
        }
        assert_eq!(db.len("net1"), 1);

        // Same key, new owner: overwritten, not duplicated.
        db.add("net1", "ep9", ip("10.0.1.5"), 24, mac(5), ip("192.168.1.3"), false)
            .await;
        assert_eq!(db.len("net1"), 1);
        let (_, _, vtep) = db.search("net1", ip("10.0.1.5")).unwrap();
        assert_eq!(vtep, ip("192.168.1.3"));
    }

    #[tokio::test]
    async fn delete_absent_is_noop() {
        let db = PeerDb::new();
        db.delete("missing", ip("10.0.1.5"), mac(5)).await;

        db.add("net1", "ep1", ip("10.0.1.5"), 24, mac(5), ip("192.168.1.2"), false)
            .await;
        db.delete("net1", ip("10.0.1.6"), mac(6)).await;
        assert_eq!(db.len("net1"), 1);
        db.delete("net1", ip("10.0.1.5"), mac(5)).await;
        assert_eq!(db.len("net1"), 0);
    }

    #[tokio::test]
    async fn search_returns_entry_or_not_found() {
        let db = PeerDb::new();
        db.add("net1", "ep1", ip("10.0.1.5"), 24, mac(5), ip("192.168.1.2"), true)
            .await;

        let (m, len, vtep) = db.search("net1", ip("10.0.1.5")).unwrap();
        assert_eq!((m, len, vtep), (mac(5), 24, ip("192.168.1.2")));
        assert!(db.search("net1", ip("10.0.1.6")).unwrap_err().is_not_found());
        assert!(db.search("net2", ip("10.0.1.5")).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn walk_skips_corrupt_key() {
        let db = PeerDb::new();
        for i in 1..=3u8 {
            db.add(
                "net1",
                &format!("ep{i}"),
                ip(&format!("10.0.1.{i}")),
                24,
                mac(i),
                ip("192.168.1.2"),
                false,
            )
            .await;
        }
        db.insert_raw(
            "net1",
            "garbage-key",
            PeerEntry {
                endpoint_id: "bad".into(),
                vtep: ip("192.168.1.2"),
                prefix_len: 24,
                is_local: false,
            },
        );

        let mut visits = 0;
        let flow = db.walk_network("net1", |_, _| {
            visits += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(visits, 3);
    }

    #[tokio::test]
    async fn walk_spans_networks_and_stops_early() {
        let db = PeerDb::new();
        db.add("net1", "a", ip("10.0.1.1"), 24, mac(1), ip("192.168.1.1"), true)
            .await;
        db.add("net2", "b", ip("10.0.2.1"), 24, mac(2), ip("192.168.1.1"), true)
            .await;

        let mut seen = Vec::new();
        let _ = db.walk(|nid, _, entry| {
            seen.push((nid.to_string(), entry.endpoint_id));
            ControlFlow::Continue(())
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![("net1".into(), "a".into()), ("net2".into(), "b".into())]
        );

        let mut count = 0;
        let flow = db.walk(|_, _, _| {
            count += 1;
            ControlFlow::Break(())
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn refresh_snapshot_excludes_local() {
        let db = PeerDb::new();
        db.add("net1", "local", ip("10.0.1.1"), 24, mac(1), ip("192.168.1.1"), true)
            .await;
        db.add("net1", "remote", ip("10.0.1.2"), 24, mac(2), ip("192.168.1.2"), false)
            .await;

        let guard = db.begin_refresh("net1").await.unwrap();
        assert_eq!(guard.peers.len(), 1);
        assert_eq!(guard.peers[0].1.endpoint_id, "remote");
        assert!(db.begin_refresh("none").await.is_none());
    }

    #[tokio::test]
    async fn point_mutation_waits_for_refresh() {
        let db = Arc::new(PeerDb::new());
        db.add("net1", "a", ip("10.0.1.1"), 24, mac(1), ip("192.168.1.2"), false)
            .await;

        let guard = db.begin_refresh("net1").await.unwrap();
        let writer = {
            let db = db.clone();
            tokio::spawn(async move {
                db.add("net1", "b", ip("10.0.1.2"), 24, mac(2), ip("192.168.1.2"), false)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.len("net1"), 1, "add must block while refresh is held");

        drop(guard);
        writer.await.unwrap();
        assert_eq!(db.len("net1"), 2);

        // Other networks are unaffected by a refresh elsewhere.
        let _guard = db.begin_refresh("net1").await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            db.add("net2", "c", ip("10.0.2.1"), 24, mac(3), ip("192.168.1.2"), false),
        )
        .await
        .unwrap();
    }
}
