//! Builders shared across the engine's unit tests.

use crate::bundle::RuleBundle;
use crate::context::{EdgeInfo, GeoInfo, RequestContext};
use crate::events::EventEmitter;
use crate::hosted::HostedServer;
use crate::proxy::UpstreamClient;
use crate::service::Engine;
use crate::ua::{HeuristicUaParser, UaInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stores::blobs::MemoryBlobStore;
use stores::control::MemoryControl;
use stores::dest_cache::DestinationCache;
use stores::events::MemoryEventStore;
use stores::kv::MemoryKv;
use stores::platform_cache::PlatformCache;

/// A plain page-like request from a US desktop Chrome visitor.
pub fn page_ctx() -> RequestContext {
    ctx_with("/lp/", &[])
}

pub fn ctx_with(path: &str, query: &[(&str, &str)]) -> RequestContext {
    RequestContext {
        host: "shop.example".into(),
        path: path.into(),
        query: query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        raw_query: None,
        headers: vec![
            ("host".into(), "shop.example".into()),
            ("user-agent".into(), "Mozilla/5.0 Chrome/126".into()),
            ("accept".into(), "text/html".into()),
        ],
        ip: "203.0.113.7".into(),
        org: None,
        referrer: None,
        is_embed: false,
        session_id: "s3ss10n1".into(),
        impression_id: None,
        ua: UaInfo {
            browser: Some("Chrome".into()),
            version: Some("126.0".into()),
            os: Some("Windows".into()),
            os_version: Some("15.0.0".into()),
            device: Some("desktop".into()),
            brand: None,
            model: None,
            arch: None,
            raw: "Mozilla/5.0 Chrome/126".into(),
        },
        geo: GeoInfo {
            country: Some("US".into()),
            ..Default::default()
        },
        edge: EdgeInfo::default(),
        is_bot: false,
    }
}

pub fn bundle(value: serde_json::Value) -> RuleBundle {
    RuleBundle::decode(&value).expect("test bundle decodes")
}

pub fn query_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A full engine over in-memory stores, with handles kept for
/// seeding and assertions.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub kv: Arc<MemoryKv>,
    pub control: Arc<MemoryControl>,
    pub events: Arc<MemoryEventStore>,
    pub assets: Arc<MemoryBlobStore>,
    pub drives: Arc<MemoryBlobStore>,
}

pub fn test_engine() -> TestEngine {
    let kv = Arc::new(MemoryKv::new());
    let control = Arc::new(MemoryControl::new());
    let events = Arc::new(MemoryEventStore::new());
    let assets = Arc::new(MemoryBlobStore::new());
    let drives = Arc::new(MemoryBlobStore::new());

    let engine = Arc::new(Engine {
        kv: kv.clone(),
        control: control.clone(),
        events: events.clone(),
        emitter: EventEmitter::new(events.clone()),
        dest_cache: DestinationCache::new(control.clone(), Duration::from_secs(60)),
        platform_cache: PlatformCache::new(control.clone(), Duration::from_secs(900)),
        hosted: HostedServer::new(assets.clone(), drives.clone(), control.clone()),
        upstream: UpstreamClient::new(Duration::from_secs(2)),
        ua_parser: Box::new(HeuristicUaParser),
        wrap_midnight: false,
    });

    TestEngine {
        engine,
        kv,
        control,
        events,
        assets,
        drives,
    }
}

/// Waits for detached event writes to land.
pub async fn settle(store: &MemoryEventStore, expected: usize) {
    for _ in 0..200 {
        if store.len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
