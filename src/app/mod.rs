//! Application wiring: build the pipeline, run it, tear it down.

pub mod config;

pub use config::Config;

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache;
use crate::detector;
use crate::domain::{Exchange, SystemStats};
use crate::error::{ConfigError, Result};
use crate::exchange::bingx::BingxCollector;
use crate::exchange::ramzinex::RamzinexCollector;
use crate::exchange::wallex::WallexCollector;
use crate::exchange::{supervisor, Collector, CollectorKind, SubscriptionTarget};
use crate::hub::{self, Hub};
use crate::registry::SymbolRegistry;
use crate::store::TopOfBookStore;

pub struct App;

impl App {
    /// Assemble and run the pipeline until Ctrl-C.
    ///
    /// Shutdown propagates through a watch channel: collectors close
    /// their sockets, the detector drains routed events, the hub closes
    /// sessions gracefully.
    pub async fn run(config: Config) -> Result<()> {
        let registry = Arc::new(SymbolRegistry::load(&config.metadata_file)?);
        if registry.is_empty() {
            return Err(ConfigError::Invalid {
                field: "metadata_file",
                reason: "no enabled markets".into(),
            }
            .into());
        }

        if let Some(mirror) = config.mirror() {
            info!(host = %mirror.host, port = mirror.port, "External snapshot mirror configured");
        }

        let stats = Arc::new(SystemStats::new());
        let store = Arc::new(TopOfBookStore::new(stats.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Cache task plus the detector → cache pump.
        let (cache_events_tx, cache_events_rx) = mpsc::channel(1024);
        let (cache_handle, cache_size, cache_task) =
            cache::spawn(config.cache_config(), cache_events_tx, shutdown_rx.clone());

        let (opportunities_tx, opportunities_rx) = mpsc::channel(1024);
        let detector_task = detector::spawn(
            store.clone(),
            registry.clone(),
            stats.clone(),
            config.detector_config(),
            opportunities_tx,
            shutdown_rx.clone(),
        );
        let cache_pump = {
            let handle = cache_handle.clone();
            tokio::spawn(async move { handle.pump(opportunities_rx).await })
        };

        // Hub pump and the dashboard endpoint.
        let hub = Arc::new(Hub::new(
            registry.clone(),
            store.clone(),
            cache_handle,
            cache_size,
            stats.clone(),
            config.hub_config(),
        ));
        let hub_task = hub
            .clone()
            .run(store.subscribe(), cache_events_rx, shutdown_rx.clone());
        let server_task = hub::server::spawn(
            config.server.bind.clone(),
            hub.clone(),
            shutdown_rx.clone(),
        );

        // One supervised collector per configured venue; the config picks
        // the variants once, at startup.
        let supervisor_config = config.supervisor_config();
        let mut kinds: Vec<CollectorKind> = Vec::new();
        if let Some(venue) = config.bingx_config() {
            kinds.push(CollectorKind::Bingx(BingxCollector::new(venue, stats.clone())));
        }
        if let Some(venue) = config.wallex_config() {
            kinds.push(CollectorKind::Wallex(WallexCollector::new(venue, stats.clone())));
        }
        if let Some(venue) = config.ramzinex_config() {
            kinds.push(CollectorKind::Ramzinex(RamzinexCollector::new(venue, stats.clone())));
        }

        let mut collectors = Vec::new();
        for kind in kinds {
            let targets = targets_for(&registry, kind.exchange());
            collectors.push(supervisor::spawn(
                kind,
                targets,
                store.clone(),
                stats.clone(),
                supervisor_config.clone(),
                shutdown_rx.clone(),
            ));
        }

        info!(
            markets = registry.market_count(),
            collectors = collectors.len(),
            bind = %config.server.bind,
            "arbwatch pipeline running"
        );

        signal::ctrl_c().await?;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);

        for collector in collectors {
            let _ = collector.await;
        }
        let _ = detector_task.await;
        let _ = cache_pump.await;
        let _ = cache_task.await;
        let _ = hub_task.await;
        let _ = server_task.await;

        info!("arbwatch stopped");
        Ok(())
    }
}

fn targets_for(registry: &SymbolRegistry, exchange: Exchange) -> Vec<SubscriptionTarget> {
    let targets: Vec<_> = registry
        .for_exchange(exchange)
        .into_iter()
        .map(|(native, pair)| SubscriptionTarget::new(native, pair))
        .collect();
    if targets.is_empty() {
        warn!(exchange = %exchange, "Venue configured but no aliases in metadata");
    }
    targets
}
