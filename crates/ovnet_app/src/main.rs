//! ovnetd: the overlay driver as a single-process daemon.
//!
//! Dataplane, sandbox and gossip are the in-process collaborators from
//! `ovnet_driver::memory`. The local store is the SQLite file named by the
//! config, so endpoints survive a restart.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use ovnet_core::logging;
use ovnet_core::{MemoryStore, OverlayConfig, SqliteStore};
use ovnet_driver::memory::{GossipHub, MemoryDataplane, MemorySandbox};
use ovnet_driver::{Backends, OverlayDriver};

fn backends(config: &OverlayConfig) -> Result<Backends> {
    let local = SqliteStore::open_configured(config)?;
    let management_ip = config
        .advertise_address
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    Ok(Backends {
        dataplane: Arc::new(MemoryDataplane::new(management_ip)),
        sandbox: Arc::new(MemorySandbox::new()),
        gossip: Arc::new(GossipHub::new().member()),
        local_store: Some(Arc::new(local)),
        global_store: Some(Arc::new(MemoryStore::new())),
        vni_allocator: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OverlayConfig::load()?;
    let _log_guard = logging::init_logging(&config)?;
    info!("Starting ovnetd v{}", env!("CARGO_PKG_VERSION"));

    let backends = backends(&config)?;
    let driver = OverlayDriver::start(config, backends)
        .await
        .context("Failed to start overlay driver")?;
    info!("Overlay driver ({}) ready", driver.network_type());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Waiting for shutdown signal failed: {e}");
    }
    info!("Shutting down");
    driver.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn driver_starts_over_configured_store() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("local.db");
        let config = OverlayConfig {
            local_store_path: Some(path.clone()),
            ..OverlayConfig::default()
        };

        let backends = backends(&config).unwrap();
        let driver = OverlayDriver::start(config, backends).await.unwrap();
        assert_eq!(driver.network_type(), "overlay");
        driver.shutdown().await;
        assert!(path.exists());
    }
}
