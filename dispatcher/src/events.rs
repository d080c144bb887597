//! Event assembly and emission (impressions, clicks, conversions).
//!
//! Emission never blocks the response: rows are handed to a detached
//! task that the runtime runs to completion even after the response has
//! flushed and the client has gone. The store's uniqueness on
//! `event_id` makes replays safe; the orphan guard drops rows with no
//! campaign attribution.

use crate::context::RequestContext;
use crate::metrics_defs::{EVENT_EMITTED, EVENT_EMIT_FAILED, EVENT_ORPHAN_SKIPPED};
use crate::snippets;
use chrono::Utc;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use hyper::Response;
use shared::http::{SvcBody, apply_accept_ch, apply_no_store, full_body};
use std::sync::Arc;
use stores::events::{Enrichment, Event, EventStore};
use stores::platform_cache::PlatformAttribution;

/// Everything an event row inherits from the dispatch before the
/// per-kind fields are set.
pub struct EventSeed<'a> {
    pub ctx: &'a RequestContext,
    pub campaign_id: &'a str,
    pub campaign_name: Option<&'a str>,
    pub site_name: Option<&'a str>,
    pub platform: Option<&'a PlatformAttribution>,
    pub platform_click_id: Option<&'a str>,
}

impl EventSeed<'_> {
    pub fn event(&self, event_id: String) -> Event {
        let ctx = self.ctx;
        Event {
            event_id,
            session_id: ctx.session_id.clone(),
            campaign_id: self.campaign_id.to_string(),
            campaign_name: self.campaign_name.map(str::to_string),
            site_name: self.site_name.map(str::to_string),
            host: ctx.host.clone(),
            path: ctx.path.clone(),
            query: ctx.query.clone(),
            referrer: ctx.referrer.clone(),
            is_embed: ctx.is_embed,
            ip: if ctx.ip.is_empty() {
                None
            } else {
                Some(ctx.ip.clone())
            },
            org: ctx.org.clone(),
            user_agent: if ctx.ua.raw.is_empty() {
                None
            } else {
                Some(ctx.ua.raw.clone())
            },
            browser: ctx.ua.browser.clone(),
            browser_version: ctx.ua.version.clone(),
            os: ctx.ua.os.clone(),
            os_version: ctx.ua.os_version.clone(),
            device: ctx.ua.device.clone(),
            brand: ctx.ua.brand.clone(),
            model: ctx.ua.model.clone(),
            arch: ctx.ua.arch.clone(),
            country: ctx.geo.country.clone(),
            region: ctx.geo.region.clone(),
            region_code: ctx.geo.region_code.clone(),
            city: ctx.geo.city.clone(),
            continent: ctx.geo.continent.clone(),
            lat: ctx.geo.lat,
            lon: ctx.geo.lon,
            timezone: ctx.geo.timezone.clone(),
            postal_code: ctx.geo.postal_code.clone(),
            asn: ctx.edge.asn,
            colo: ctx.edge.colo.clone(),
            bot_score: ctx.edge.bot_score,
            trust_score: ctx.edge.trust_score,
            verified_bot: ctx.edge.verified_bot,
            http_protocol: ctx.edge.http_protocol.clone(),
            tls_version: ctx.edge.tls_version.clone(),
            tls_cipher: ctx.edge.tls_cipher.clone(),
            platform_id: self.platform.map(|p| p.platform_id.clone()),
            platform_name: self.platform.map(|p| p.platform_name.clone()),
            platform_click_id: self.platform_click_id.map(str::to_string),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    store: Arc<dyn EventStore>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        EventEmitter { store }
    }

    /// Schedules the insert on a detached task. Failures are logged and
    /// swallowed; they never surface to the client.
    pub fn emit(&self, event: Event) {
        if event.campaign_id.is_empty() {
            metrics::counter!(EVENT_ORPHAN_SKIPPED.name).increment(1);
            tracing::debug!(event_id = %event.event_id, "skipping event without campaign");
            return;
        }

        let kind = if event.is_conversion {
            "conversion"
        } else if event.is_click && event.is_impression {
            "redirect"
        } else if event.is_click {
            "click"
        } else {
            "impression"
        };
        metrics::counter!(EVENT_EMITTED.name, "kind" => kind).increment(1);

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert(&event).await {
                metrics::counter!(EVENT_EMIT_FAILED.name).increment(1);
                tracing::warn!(event_id = %event.event_id, error = %e, "event insert failed");
            }
        });
    }

    /// Best-effort enrichment update, also detached.
    pub fn enrich(&self, impression_id: String, enrichment: Enrichment) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_enrichment(&impression_id, &enrichment).await {
                tracing::debug!(impression_id, error = %e, "enrichment update failed");
            }
        });
    }
}

/// OS versions frozen by privacy features; their presence says nothing
/// about the real device.
const STALE_OS_VERSIONS: &[&str] = &["10.15.7", "10.0"];

/// Whether the headers alone carried enough device signal to skip the
/// in-page probe and answer with a plain 302.
pub fn signals_sufficient(ctx: &RequestContext) -> bool {
    let os_version = ctx.ua.os_version.as_deref();
    match ctx.ua.device.as_deref() {
        Some("desktop") => os_version.is_some_and(|v| !STALE_OS_VERSIONS.contains(&v)),
        Some("mobile") | Some("tablet") => {
            let safari_ios = ctx.ua.browser.as_deref() == Some("Safari")
                && ctx.ua.os.as_deref() == Some("iOS");
            os_version.is_some() && !safari_ios
        }
        _ => false,
    }
}

/// Redirect delivery honoring the latency policy: a plain 302 when the
/// signals suffice, otherwise the probe-then-navigate HTML stub.
pub fn redirect_response(
    location: &str,
    ctx: &RequestContext,
    impression_id: &str,
) -> Response<SvcBody> {
    if signals_sufficient(ctx) {
        let mut response = Response::new(full_body(Vec::new()));
        *response.status_mut() = StatusCode::FOUND;
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers_mut().insert(LOCATION, value);
        }
        apply_no_store(response.headers_mut());
        return response;
    }

    let stub = snippets::redirect_stub(location, impression_id);
    let mut response = Response::new(full_body(stub));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    apply_no_store(response.headers_mut());
    apply_accept_ch(response.headers_mut());
    response
}
