use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use ovnet_core::{KvStore, MemoryStore, OverlayConfig, SqliteStore};
use ovnet_driver::driverapi::RouteType;
use ovnet_driver::memory::{GossipHub, MemoryDataplane, MemorySandbox};
use ovnet_driver::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Host {
    driver: OverlayDriver,
    dataplane: Arc<MemoryDataplane>,
    sandbox: Arc<MemorySandbox>,
}

async fn start_host(
    config: OverlayConfig,
    dataplane: Arc<MemoryDataplane>,
    gossip: Arc<dyn Gossip>,
    local: Arc<dyn KvStore>,
    global: Arc<dyn KvStore>,
) -> Host {
    let sandbox = Arc::new(MemorySandbox::new());
    let driver = OverlayDriver::start(
        config,
        Backends {
            dataplane: dataplane.clone(),
            sandbox: sandbox.clone(),
            gossip,
            local_store: Some(local),
            global_store: Some(global),
            vni_allocator: None,
        },
    )
    .await
    .unwrap();
    Host {
        driver,
        dataplane,
        sandbox,
    }
}

async fn single_host(pa: &str) -> Host {
    start_host(
        OverlayConfig::default(),
        Arc::new(MemoryDataplane::new(pa.parse().unwrap())),
        Arc::new(GossipHub::new().member()),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
    )
    .await
}

fn pool(cidr: &str) -> IpamData {
    let pool: Ipv4Net = cidr.parse().unwrap();
    let gw = Ipv4Net::new(pool.hosts().next().unwrap(), pool.prefix_len()).unwrap();
    IpamData::new(pool, Some(gw))
}

async fn create_network(h: &Host, cidrs: &[&str]) {
    let pools: Vec<IpamData> = cidrs.iter().map(|c| pool(c)).collect();
    h.driver
        .create_network("net1", &mut NetworkOptions::new(), &pools)
        .await
        .unwrap();
}

async fn attach(h: &Host, eid: &str, addr: &str) -> JoinResponse {
    let mut iface = EndpointInterface::new(addr.parse().unwrap());
    h.driver.create_endpoint("net1", eid, &mut iface).await.unwrap();
    let mut jr = JoinResponse::default();
    h.driver.join("net1", eid, &mut jr).await.unwrap();
    jr
}

fn entries(h: &Host) -> Vec<(PeerKey, PeerEntry)> {
    let mut out = Vec::new();
    let _ = h.driver.peers().walk_network("net1", |key, entry| {
        out.push((key, entry));
        ControlFlow::Continue(())
    });
    out
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Single host
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_publishes_one_local_peer() {
    let h = single_host("192.168.1.1").await;
    create_network(&h, &["10.0.1.0/24", "10.0.2.0/24"]).await;
    let jr = attach(&h, "ep1", "10.0.1.5/24").await;

    let peers = entries(&h);
    assert_eq!(peers.len(), 1);
    let (key, entry) = &peers[0];
    assert_eq!(key.ip, ip("10.0.1.5"));
    assert!(entry.is_local);
    assert_eq!(entry.vtep, ip("192.168.1.1"));
    assert_eq!(entry.endpoint_id, "ep1");

    assert_eq!(jr.table_entries.len(), 1);
    let published = &jr.table_entries[0];
    assert_eq!(published.table, OVERLAY_PEER_TABLE);
    assert_eq!(published.key, "ep1");
    let record = PeerRecord::decode(&published.value).unwrap();
    assert_eq!(record.endpoint_ip, "10.0.1.5/24");
    assert_eq!(record.tunnel_endpoint_ip, "192.168.1.1");

    // Only the other subnet gets a route, through this subnet's gateway.
    assert_eq!(jr.static_routes.len(), 1);
    assert_eq!(jr.static_routes[0].destination, "10.0.2.0/24".parse().unwrap());
    assert_eq!(jr.static_routes[0].route_type, RouteType::NextHop);
    assert_eq!(jr.static_routes[0].next_hop, Some(ip("10.0.1.1")));
    assert!(jr.gateway_disabled);

    let info = h.driver.endpoint_oper_info("net1", "ep1").await.unwrap();
    assert!(h.dataplane.endpoint(&info["hnsid"]).unwrap().is_local_endpoint);
}

#[tokio::test]
async fn remote_peer_programs_tunnel_neighbor() {
    let h = single_host("192.168.1.1").await;
    create_network(&h, &["10.0.1.0/24"]).await;

    let value = PeerRecord::new(
        "10.0.1.9/24".parse().unwrap(),
        "02:42:0a:00:01:09".parse().unwrap(),
        ip("192.168.1.2"),
    )
    .encode()
    .unwrap();
    h.driver
        .event_notify(EventKind::Add, "net1", OVERLAY_PEER_TABLE, "ep9", &value)
        .await;

    let (mac, prefix_len, vtep) = h.driver.peers().search("net1", ip("10.0.1.9")).unwrap();
    assert_eq!(mac.to_string().to_lowercase(), "02:42:0a:00:01:09");
    assert_eq!(prefix_len, 24);
    assert_eq!(vtep, ip("192.168.1.2"));
    assert!(entries(&h).iter().all(|(_, e)| !e.is_local));

    let n = h.driver.network("net1").await.unwrap().unwrap();
    let subnet = n.matching_subnet(&"10.0.1.0/24".parse().unwrap()).unwrap();
    assert_ne!(subnet.vni, 0);
    let neighbor = h.sandbox.neighbor("net1", ip("10.0.1.9")).unwrap();
    assert_eq!(neighbor.link, subnet.vxlan_name("net1"));

    // The shadow endpoint tunnels through the remote host.
    let (_, shadow) = h
        .dataplane
        .endpoints()
        .into_iter()
        .find(|(_, e)| !e.is_local_endpoint)
        .unwrap();
    assert_eq!(shadow.ip_address, ip("10.0.1.9"));
    assert_eq!(
        serde_json::to_value(&shadow.policies).unwrap()[0]["PA"],
        "192.168.1.2"
    );
}

#[tokio::test]
async fn unknown_table_and_network_are_ignored() {
    let h = single_host("192.168.1.1").await;
    create_network(&h, &["10.0.1.0/24"]).await;
    let value = PeerRecord::new(
        "10.0.1.9/24".parse().unwrap(),
        "02:42:0a:00:01:09".parse().unwrap(),
        ip("192.168.1.2"),
    )
    .encode()
    .unwrap();

    h.driver
        .event_notify(EventKind::Add, "net1", "other_table", "ep9", &value)
        .await;
    h.driver
        .event_notify(EventKind::Add, "net404", OVERLAY_PEER_TABLE, "ep9", &value)
        .await;
    assert!(entries(&h).is_empty());
    assert_eq!(h.driver.peers().len("net404"), 0);
}

#[tokio::test]
async fn delete_network_forgets_everything() {
    let h = single_host("192.168.1.1").await;
    create_network(&h, &["10.0.1.0/24"]).await;
    attach(&h, "ep1", "10.0.1.5/24").await;

    h.driver.delete_network("net1").await.unwrap();
    assert!(h.driver.network("net1").await.unwrap().is_none());
    assert_eq!(h.driver.peers().len("net1"), 0);
    assert!(!h.sandbox.has_network("net1"));
    assert_eq!(h.dataplane.network_count(), 0);
}

#[tokio::test]
async fn ids_are_validated_at_the_boundary() {
    let h = single_host("192.168.1.1").await;
    let mut iface = EndpointInterface::new("10.0.1.5/24".parse().unwrap());
    let err = h.driver.create_endpoint("", "ep1", &mut iface).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = h.driver.join("net1", "", &mut JoinResponse::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = h.driver.delete_network("net404").await.unwrap_err();
    assert!(err.to_string().contains("net404"));
    assert!(!err.is_retryable());
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_restores_endpoints_and_purges_stale_ones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let global: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let dataplane = Arc::new(MemoryDataplane::new(ip("192.168.1.1")));

    let vni = {
        let local = Arc::new(SqliteStore::open_at(path.clone()).unwrap());
        let h = start_host(
            OverlayConfig::default(),
            dataplane.clone(),
            Arc::new(GossipHub::new().member()),
            local.clone(),
            global.clone(),
        )
        .await;
        create_network(&h, &["10.0.1.0/24"]).await;
        attach(&h, "ep1", "10.0.1.5/24").await;

        // An endpoint whose network no longer exists anywhere.
        let stale = br#"{"id":"stale","nid":"gone","addr":"10.5.0.2/24","mac":"02:00:00:00:00:05"}"#;
        local
            .put_atomic("overlay/endpoint/stale", stale.to_vec(), None)
            .unwrap();

        let n = h.driver.network("net1").await.unwrap().unwrap();
        let vni = n.subnets()[0].vni;
        h.driver.shutdown().await;
        vni
    };
    assert_ne!(vni, 0);

    let local = Arc::new(SqliteStore::open_at(path).unwrap());
    let h = start_host(
        OverlayConfig::default(),
        dataplane.clone(),
        Arc::new(GossipHub::new().member()),
        local.clone(),
        global.clone(),
    )
    .await;

    let (_, prefix_len, vtep) = h.driver.peers().search("net1", ip("10.0.1.5")).unwrap();
    assert_eq!((prefix_len, vtep), (24, ip("192.168.1.1")));
    assert!(entries(&h)[0].1.is_local);
    assert!(local.get("overlay/endpoint/stale").unwrap_err().is_not_found());
    assert!(local.get("overlay/endpoint/ep1").is_ok());

    // The local network record spared the dataplane a second create.
    assert_eq!(dataplane.calls().create_network, 1);

    let n = h.driver.network("net1").await.unwrap().unwrap();
    assert_eq!(n.subnets()[0].vni, vni);
    assert!(n.endpoint("ep1").is_some());
}

// ---------------------------------------------------------------------------
// Two hosts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_hosts_exchange_peers_over_gossip() {
    let hub = GossipHub::new();
    let global: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let loopback = ip("127.0.0.1");

    let config = |port: u16| OverlayConfig {
        advertise_address: Some(loopback),
        gossip_port: port,
        ..OverlayConfig::default()
    };
    let a = start_host(
        config(7946),
        Arc::new(MemoryDataplane::new(ip("192.168.1.1"))),
        Arc::new(hub.member()),
        Arc::new(MemoryStore::new()),
        global.clone(),
    )
    .await;
    let b = start_host(
        config(7947),
        Arc::new(MemoryDataplane::new(ip("192.168.1.2"))),
        Arc::new(hub.member()),
        Arc::new(MemoryStore::new()),
        global.clone(),
    )
    .await;
    assert_eq!(a.driver.cluster_state(), ClusterState::GossipStarted);
    assert_eq!(hub.started_members(), 2);

    create_network(&a, &["10.0.1.0/24"]).await;
    attach(&a, "ep1", "10.0.1.5/24").await;

    // B picks the network up from the global store and agrees on the VNI.
    attach(&b, "ep2", "10.0.1.6/24").await;
    let vni_a = a.driver.network("net1").await.unwrap().unwrap().subnets()[0].vni;
    let vni_b = b.driver.network("net1").await.unwrap().unwrap().subnets()[0].vni;
    assert_eq!(vni_a, vni_b);

    // Joining through A pushes B's local endpoints.
    b.driver
        .discover_new(DiscoveryData::Node {
            address: loopback,
            bind_address: None,
            is_self: false,
        })
        .await
        .unwrap();
    assert_eq!(b.driver.cluster_state(), ClusterState::Joined);
    assert!(
        eventually(|| a.driver.peers().search("net1", ip("10.0.1.6")).is_ok()).await,
        "A never learned ep2"
    );
    let (_, _, vtep) = a.driver.peers().search("net1", ip("10.0.1.6")).unwrap();
    assert_eq!(vtep, ip("192.168.1.2"));
    assert!(a.sandbox.neighbor("net1", ip("10.0.1.6")).is_some());

    // New joins on A now reach B.
    attach(&a, "ep3", "10.0.1.7/24").await;
    assert!(
        eventually(|| b.driver.peers().search("net1", ip("10.0.1.7")).is_ok()).await,
        "B never learned ep3"
    );

    a.driver.leave("net1", "ep3").await.unwrap();
    assert!(
        eventually(|| b.driver.peers().search("net1", ip("10.0.1.7")).is_err()).await,
        "B kept ep3 after leave"
    );
    assert!(b.sandbox.neighbor("net1", ip("10.0.1.7")).is_none());

    a.driver.shutdown().await;
    b.driver.shutdown().await;
    assert_eq!(hub.started_members(), 0);
}
