pub mod blocklist;
pub mod bundle;
pub mod clickout;
pub mod config;
pub mod context;
pub mod enrich;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod hosted;
pub mod macros;
pub mod matcher;
pub mod metrics_defs;
pub mod modifications;
pub mod pages;
pub mod postback;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod selector;
pub mod service;
pub mod snippets;
pub mod ua;

#[cfg(test)]
pub(crate) mod testutils;

pub use errors::{DispatchError, Result};

use crate::config::{BlobBackend, Config, EventBackend, KvBackend};
use crate::events::EventEmitter;
use crate::hosted::HostedServer;
use crate::proxy::UpstreamClient;
use crate::service::{DispatchService, Engine};
use crate::ua::HeuristicUaParser;
use shared::http::{AdminService, run_http_service};
use std::sync::Arc;
use std::time::Duration;
use stores::blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
use stores::control::{ControlPlane, ControlStore};
use stores::dest_cache::DestinationCache;
use stores::events::{EventStore, MemoryEventStore, RestEventStore};
use stores::kv::{KvStore, MemoryKv, RestKv};
use stores::platform_cache::PlatformCache;

fn build_engine(config: &Config) -> Engine {
    let kv: Arc<dyn KvStore> = match &config.stores.kv {
        KvBackend::Memory => Arc::new(MemoryKv::new()),
        KvBackend::Rest { url } => Arc::new(RestKv::new(url.clone())),
    };
    let control: Arc<dyn ControlStore> =
        Arc::new(ControlPlane::new(config.stores.control_url.clone()));
    let events: Arc<dyn EventStore> = match &config.stores.events {
        EventBackend::Memory => Arc::new(MemoryEventStore::new()),
        EventBackend::Rest { url } => Arc::new(RestEventStore::new(url.clone())),
    };
    let blob = |backend: &BlobBackend| -> Arc<dyn BlobStore> {
        match backend {
            BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
            BlobBackend::Filesystem { path } => Arc::new(FsBlobStore::new(path.clone())),
        }
    };

    let emitter = EventEmitter::new(events.clone());
    let dest_cache = DestinationCache::new(
        control.clone(),
        Duration::from_millis(config.engine.dest_cache_fast_path_ms),
    );
    let platform_cache = PlatformCache::new(
        control.clone(),
        Duration::from_secs(config.engine.platform_cache_ttl_secs),
    );
    let hosted = HostedServer::new(
        blob(&config.stores.assets),
        blob(&config.stores.drives),
        control.clone(),
    );
    let upstream = UpstreamClient::new(Duration::from_secs(config.engine.upstream_timeout_secs));

    Engine {
        kv,
        control,
        events,
        emitter,
        dest_cache,
        platform_cache,
        hosted,
        upstream,
        ua_parser: Box::new(HeuristicUaParser),
        wrap_midnight: config.engine.match_time_wraps_midnight,
    }
}

/// Runs the dispatcher until the listener fails.
pub async fn run(config: Config) -> Result<()> {
    let engine = Arc::new(build_engine(&config));

    if let Some(admin) = config.admin_listener.clone() {
        tokio::spawn(async move {
            let service = AdminService::new(|| true);
            if let Err(e) = run_http_service(&admin.host, admin.port, service).await {
                tracing::error!(error = %e, "admin listener failed");
            }
        });
    }

    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "dispatcher listening"
    );
    run_http_service(
        &config.listener.host,
        config.listener.port,
        DispatchService::new(engine),
    )
    .await
}
