use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use macaddr::MacAddr6;

use crate::error::Result;

/// The per-host context into which tunnel links and neighbor entries are
/// installed, one per overlay network.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Create or attach to the sandbox for `nid`. Idempotent.
    async fn join_network(&self, nid: &str) -> Result<()>;

    /// Bring up the tunnel link for one subnet. Idempotent.
    async fn join_subnet(&self, nid: &str, subnet: Ipv4Net, vni: u32, link: &str) -> Result<()>;

    async fn leave_network(&self, nid: &str) -> Result<()>;

    /// Bind `ip` to `mac` on the tunnel link `link`.
    async fn add_neighbor(&self, nid: &str, ip: IpAddr, mac: MacAddr6, link: &str) -> Result<()>;

    async fn delete_neighbor(&self, nid: &str, ip: IpAddr, mac: MacAddr6) -> Result<()>;
}
