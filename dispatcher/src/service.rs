//! The dispatch service: one hyper `Service` that routes the reserved
//! endpoints (postback, enrichment, proxy-session, track.js, `/click`)
//! and runs the main pipeline — enrich, resolve, filter, match, select,
//! execute, emit — for everything else.

use crate::blocklist;
use crate::bundle::{DomEdit, FolderMode, Rule, RuleAction};
use crate::clickout;
use crate::context::{self, RequestContext};
use crate::enrich;
use crate::errors::DispatchError;
use crate::events::{self, EventEmitter, EventSeed};
use crate::fingerprint;
use crate::hosted::HostedServer;
use crate::macros::{MacroInputs, MacroTable};
use crate::matcher::{MatchOptions, RuleMatch, matching_rules};
use crate::metrics_defs::{ACTION_EXECUTED, BLOCK_SERVED, UPSTREAM_FETCH_DURATION};
use crate::pages;
use crate::postback;
use crate::proxy::{self, UpstreamClient};
use crate::resolver::{self, DefaultLanding, ResolvedBundle};
use crate::rewrite::{self, LinkTarget};
use crate::selector;
use crate::snippets;
use crate::ua::UserAgentParser;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::http::{SvcBody, apply_accept_ch, full_body, make_boxed_error_response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use stores::control::ControlStore;
use stores::dest_cache::DestinationCache;
use stores::events::EventStore;
use stores::kv::KvStore;
use stores::platform_cache::{PlatformAttribution, PlatformCache};
use url::Url;

const ENRICH_BODY_LIMIT: usize = 64 * 1024;

/// Minimal safe page served when nothing resolves.
const NOT_FOUND_PAGE: &str = "<!DOCTYPE html><html><head><title>Not Found</title></head>\
     <body><h1>404</h1><p>The page you requested could not be found.</p></body></html>";

pub struct Engine {
    pub kv: Arc<dyn KvStore>,
    pub control: Arc<dyn ControlStore>,
    pub events: Arc<dyn EventStore>,
    pub emitter: EventEmitter,
    pub dest_cache: DestinationCache,
    pub platform_cache: PlatformCache,
    pub hosted: HostedServer,
    pub upstream: UpstreamClient,
    pub ua_parser: Box<dyn UserAgentParser>,
    /// Whether inverted time flags wrap past midnight.
    pub wrap_midnight: bool,
}

#[derive(Clone)]
pub struct DispatchService {
    engine: Arc<Engine>,
}

impl DispatchService {
    pub fn new(engine: Arc<Engine>) -> Self {
        DispatchService { engine }
    }
}

impl HyperService<Request<Incoming>> for DispatchService {
    type Response = Response<SvcBody>;
    type Error = DispatchError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let engine = self.engine.clone();
        Box::pin(async move { Ok(handle(engine, req).await) })
    }
}

pub async fn handle<B>(engine: Arc<Engine>, req: Request<B>) -> Response<SvcBody>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if parts.method == Method::POST && path == snippets::ENRICH_PATH {
        let bytes = match http_body_util::Limited::new(body, ENRICH_BODY_LIMIT)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            // Still a 204: enrichment is best effort by contract.
            Err(_) => bytes::Bytes::new(),
        };
        return enrich::handle(&bytes, &engine.emitter);
    }

    if parts.method != Method::GET && parts.method != Method::HEAD {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    if context::is_prefetch(&parts) {
        let mut response = Response::new(full_body(Vec::new()));
        *response.status_mut() = StatusCode::NO_CONTENT;
        return response;
    }

    let query = query_map(parts.uri.query());

    if path == "/postback" {
        return postback::handle(&query, &engine.events, &engine.emitter).await;
    }

    if path == "/proxy-session" {
        return proxy_session(&engine, &query).await;
    }

    let ctx = match RequestContext::from_parts(&parts, engine.ua_parser.as_ref()) {
        Ok(ctx) => ctx,
        Err(DispatchError::InvalidEmbedUrl) => {
            let mut response =
                Response::new(full_body("/* invalid url parameter */\n"));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            set_js_content_type(&mut response);
            return response;
        }
        Err(e) => {
            tracing::error!(error = %e, "request enrichment failed");
            return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    dispatch(&engine, ctx).await
}

async fn dispatch(engine: &Arc<Engine>, ctx: RequestContext) -> Response<SvcBody> {
    let resolved = match resolver::resolve_bundle(engine.kv.as_ref(), &ctx.host, &ctx.path).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => return finish(&ctx, not_found_page()).await,
        Err(e) => {
            tracing::error!(host = %ctx.host, path = %ctx.path, error = %e, "rule lookup failed");
            return finish(&ctx, not_found_page()).await;
        }
    };
    let bundle = &resolved.bundle;

    let platform = engine.platform_cache.get(&bundle.id).await;
    let platform_click_id = platform
        .as_ref()
        .and_then(|p| p.click_id_param.as_ref())
        .and_then(|param| ctx.query.get(param))
        .cloned();

    let mut rng = StdRng::from_entropy();

    // Deny lists and bot traffic bypass matching and get the default.
    let blocked = ctx.is_bot
        || bundle
            .blocks
            .as_ref()
            .and_then(|blocks| blocklist::block_reason(blocks, &ctx))
            .inspect(|reason| {
                tracing::debug!(campaign = %bundle.id, reason, "request blocked");
            })
            .is_some();

    if blocked {
        metrics::counter!(BLOCK_SERVED.name).increment(1);
        let landing = resolver::collapse_default(bundle, &engine.dest_cache, &mut rng).await;
        return match landing {
            Some(landing) => {
                execute_landing(
                    engine,
                    &ctx,
                    &resolved,
                    landing,
                    None,
                    platform.as_deref(),
                    platform_click_id.as_deref(),
                    true,
                )
                .await
            }
            None => finish(&ctx, not_found_page()).await,
        };
    }

    let opts = MatchOptions {
        wrap_midnight: engine.wrap_midnight,
        ..MatchOptions::default()
    };
    let matches = matching_rules(&bundle.rules, &ctx, &opts);

    if clickout::is_click_path(&ctx.path) {
        let deps = clickout::ClickDeps {
            dest_cache: &engine.dest_cache,
            events: &engine.events,
            emitter: &engine.emitter,
            platform: platform.as_deref(),
            platform_click_id: platform_click_id.as_deref(),
        };
        match clickout::handle(&ctx, bundle, &matches, &deps, &mut rng).await {
            Ok(Some(response)) => return finish_redirectish(&ctx, response).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(campaign = %bundle.id, error = %e, "click-out failed");
                return finish(&ctx, not_found_page()).await;
            }
        }
    }

    let picked = selector::pick(&matches, |m| u64::from(m.rule.effective_weight()), &mut rng);

    match picked {
        Some(m) => {
            let Some(delivery) = resolve_delivery(m.rule, &mut rng) else {
                return finish(&ctx, not_found_page()).await;
            };
            execute_delivery(
                engine,
                &ctx,
                &resolved,
                delivery,
                Some(m),
                platform.as_deref(),
                platform_click_id.as_deref(),
                false,
            )
            .await
        }
        None => {
            let landing = resolver::collapse_default(bundle, &engine.dest_cache, &mut rng).await;
            match landing {
                Some(landing) => {
                    execute_landing(
                        engine,
                        &ctx,
                        &resolved,
                        landing,
                        None,
                        platform.as_deref(),
                        platform_click_id.as_deref(),
                        false,
                    )
                    .await
                }
                None => finish(&ctx, not_found_page()).await,
            }
        }
    }
}

/// What one dispatch ends up doing.
enum Delivery<'a> {
    Hosted { folder: String },
    Proxy { url: String },
    Redirect { url: String },
    Modifications { edits: &'a [DomEdit] },
}

/// Collapses a rule's action (including weighted destination lists)
/// into a concrete delivery.
fn resolve_delivery<'a, R: Rng + ?Sized>(rule: &'a Rule, rng: &mut R) -> Option<Delivery<'a>> {
    match rule.action()? {
        RuleAction::Folder(folder) => Some(Delivery::Hosted {
            folder: folder.to_string(),
        }),
        RuleAction::Proxy(url) => Some(Delivery::Proxy {
            url: url.to_string(),
        }),
        RuleAction::Redirect(url) => Some(Delivery::Redirect {
            url: url.to_string(),
        }),
        RuleAction::Modifications(edits) => Some(Delivery::Modifications { edits }),
        RuleAction::Destinations(destinations) => {
            let picked = selector::pick(destinations, |d| u64::from(d.weight.unwrap_or(1)), rng)?;
            if let Some(folder) = &picked.folder {
                Some(Delivery::Hosted {
                    folder: folder.clone(),
                })
            } else if let Some(url) = &picked.proxy_url {
                Some(Delivery::Proxy { url: url.clone() })
            } else {
                picked
                    .redirect_target()
                    .map(|url| Delivery::Redirect {
                        url: url.to_string(),
                    })
            }
        }
    }
}

/// Maps a collapsed default landing onto the delivery executor.
#[allow(clippy::too_many_arguments)]
async fn execute_landing(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    resolved: &ResolvedBundle,
    landing: DefaultLanding,
    rule_match: Option<&RuleMatch<'_>>,
    platform: Option<&PlatformAttribution>,
    platform_click_id: Option<&str>,
    suppress_probe: bool,
) -> Response<SvcBody> {
    let delivery = match landing.mode {
        FolderMode::Hosted => Delivery::Hosted {
            folder: landing.target,
        },
        FolderMode::Proxy => Delivery::Proxy {
            url: landing.target,
        },
        FolderMode::Redirect => Delivery::Redirect {
            url: landing.target,
        },
    };
    execute_delivery(
        engine,
        ctx,
        resolved,
        delivery,
        rule_match,
        platform,
        platform_click_id,
        suppress_probe,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn execute_delivery(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    resolved: &ResolvedBundle,
    delivery: Delivery<'_>,
    rule_match: Option<&RuleMatch<'_>>,
    platform: Option<&PlatformAttribution>,
    platform_click_id: Option<&str>,
    suppress_probe: bool,
) -> Response<SvcBody> {
    let bundle = &resolved.bundle;
    let event_id = fingerprint::new_event_id();
    let rule_variables = rule_match.map(|m| &m.rule.variables);

    let seed = EventSeed {
        ctx,
        campaign_id: &bundle.id,
        campaign_name: bundle.name.as_deref(),
        site_name: bundle.site_name.as_deref(),
        platform,
        platform_click_id,
    };

    let mode_tag = match &delivery {
        Delivery::Hosted { .. } => "hosted",
        Delivery::Proxy { .. } => "proxy",
        Delivery::Redirect { .. } => "redirect",
        Delivery::Modifications { .. } => "modifications",
    };
    metrics::counter!(ACTION_EXECUTED.name, "mode" => mode_tag).increment(1);

    // Redirect macros expose the conjoined id as both click and
    // impression; content macros expose the impression only.
    let macros = MacroTable::build(
        ctx,
        &MacroInputs {
            bundle: Some(bundle),
            rule_variables,
            click_id: matches!(delivery, Delivery::Redirect { .. }).then_some(event_id.as_str()),
            impression_id: Some(&event_id),
            platform,
            platform_click_id,
        },
    );
    let probe = (!suppress_probe).then(|| snippets::device_probe(&event_id));

    match delivery {
        Delivery::Hosted { folder } => {
            let served = engine
                .hosted
                .serve(&folder, ctx, &bundle.id, &macros, probe.as_deref())
                .await;
            match served {
                Ok(Some(response)) => {
                    if ctx.is_page_like() {
                        let mut event = seed.event(event_id);
                        event.is_impression = true;
                        event.impression_id = Some(event.event_id.clone());
                        event.landing_page = Some(folder);
                        event.landing_page_mode = Some("hosted".into());
                        engine.emitter.emit(event);
                    }
                    finish(ctx, response).await
                }
                Ok(None) => finish(ctx, not_found_page()).await,
                Err(e) => {
                    tracing::error!(campaign = %bundle.id, folder, error = %e, "hosted serve failed");
                    finish(ctx, not_found_page()).await
                }
            }
        }

        Delivery::Proxy { url } => {
            let base = match proxy::proxy_base_url(&url, &ctx.path, ctx.raw_query.as_deref()) {
                Ok(base) => base,
                Err(e) => {
                    tracing::warn!(campaign = %bundle.id, url, error = %e, "bad proxy destination");
                    return finish(ctx, not_found_page()).await;
                }
            };
            serve_upstream(engine, ctx, seed, event_id, base, &macros, probe.as_deref(), None).await
        }

        Delivery::Modifications { edits } => {
            // The origin page is the request's own host.
            let origin = format!("https://{}{}", ctx.host, ctx.path);
            let base = match proxy::proxy_base_url(&origin, &ctx.path, ctx.raw_query.as_deref()) {
                Ok(base) => base,
                Err(e) => {
                    tracing::warn!(campaign = %bundle.id, origin, error = %e, "bad origin url");
                    return finish(ctx, not_found_page()).await;
                }
            };
            serve_upstream(
                engine,
                ctx,
                seed,
                event_id,
                base,
                &macros,
                probe.as_deref(),
                Some(edits),
            )
            .await
        }

        Delivery::Redirect { url } => {
            // Redirect mode requires the rule to sit at the exact
            // request path; a prefix match must not redirect.
            if !paths_equivalent(resolved.key_path(&ctx.host), &ctx.path) {
                return finish(ctx, not_found_page()).await;
            }

            let location = macros.expand_url(&url);
            let mut event = seed.event(event_id.clone());
            event.is_impression = true;
            event.is_click = true;
            event.impression_id = Some(event_id.clone());
            event.click_id = Some(event_id.clone());
            event.destination_url = Some(location.clone());
            event.landing_page = Some(location.clone());
            event.landing_page_mode = Some("redirect".into());
            engine.emitter.emit(event);

            if ctx.is_embed {
                let mut response = Response::new(full_body(snippets::embed_redirect(&location)));
                set_js_content_type(&mut response);
                shared::http::apply_no_store(response.headers_mut());
                return response;
            }
            events::redirect_response(&location, ctx, &event_id)
        }
    }
}

/// Shared upstream path for proxy and modifications deliveries.
#[allow(clippy::too_many_arguments)]
async fn serve_upstream(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    seed: EventSeed<'_>,
    event_id: String,
    base: Url,
    macros: &MacroTable,
    probe: Option<&str>,
    edits: Option<&[DomEdit]>,
) -> Response<SvcBody> {
    let started = Instant::now();
    let outcome = proxy::serve_proxied(&engine.upstream, base, macros, probe, edits).await;
    metrics::histogram!(UPSTREAM_FETCH_DURATION.name).record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(outcome) => {
            // Impressions only for 2xx upstream answers on pages.
            if outcome.success && ctx.is_page_like() {
                let mut event = seed.event(event_id);
                event.is_impression = true;
                event.impression_id = Some(event.event_id.clone());
                event.landing_page = Some(outcome.final_url);
                event.landing_page_mode = Some("proxy".into());
                engine.emitter.emit(event);
            }
            finish(ctx, outcome.response).await
        }
        Err(DispatchError::UpstreamTimeout(url)) => {
            tracing::warn!(url, "upstream deadline exceeded");
            finish(ctx, not_found_page()).await
        }
        Err(e) => {
            tracing::error!(error = %e, "upstream fetch failed");
            make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /proxy-session?url=...`: proxy the given URL and keep the
/// session inside the proxy by rewriting links back through it. No
/// events: there is no campaign attribution here.
async fn proxy_session(engine: &Arc<Engine>, query: &HashMap<String, String>) -> Response<SvcBody> {
    let Some(target) = query.get("url") else {
        return make_boxed_error_response(StatusCode::BAD_REQUEST);
    };
    let Ok(url) = Url::parse(target) else {
        return make_boxed_error_response(StatusCode::BAD_REQUEST);
    };
    if !matches!(url.scheme(), "http" | "https") {
        return make_boxed_error_response(StatusCode::BAD_REQUEST);
    }

    let upstream = match engine.upstream.fetch(&url).await {
        Ok(upstream) => upstream,
        Err(DispatchError::UpstreamTimeout(_)) => return not_found_page(),
        Err(e) => {
            tracing::error!(url = %url, error = %e, "proxy-session fetch failed");
            return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let content_type = upstream
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let target_mode = LinkTarget::ProxySession {
        base: &upstream.final_url,
    };
    let body = if pages::is_html_content_type(&content_type) {
        match std::str::from_utf8(&upstream.body) {
            Ok(html) => bytes::Bytes::from(rewrite::rewrite_html(html, &target_mode, None)),
            Err(_) => upstream.body.clone(),
        }
    } else if pages::is_css_content_type(&content_type) {
        match std::str::from_utf8(&upstream.body) {
            Ok(css) => bytes::Bytes::from(rewrite::rewrite_css(css, &target_mode)),
            Err(_) => upstream.body.clone(),
        }
    } else {
        upstream.body.clone()
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = upstream.status;
    if let Ok(value) = HeaderValue::from_str(&content_type)
        && !content_type.is_empty()
    {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    shared::http::strip_proxied_headers(response.headers_mut());
    response
}

/// Applies embed-mode wrapping to content responses.
async fn finish(ctx: &RequestContext, response: Response<SvcBody>) -> Response<SvcBody> {
    if !ctx.is_embed {
        return response;
    }
    wrap_embed(response).await
}

/// Click-out and other redirects in embed mode become JS navigation.
async fn finish_redirectish(ctx: &RequestContext, response: Response<SvcBody>) -> Response<SvcBody> {
    if !ctx.is_embed {
        return response;
    }
    if let Some(location) = response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|v| v.to_str().ok())
    {
        let mut wrapped = Response::new(full_body(snippets::embed_redirect(location)));
        set_js_content_type(&mut wrapped);
        shared::http::apply_no_store(wrapped.headers_mut());
        return wrapped;
    }
    wrap_embed(response).await
}

async fn wrap_embed(response: Response<SvcBody>) -> Response<SvcBody> {
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(pages::is_html_content_type);
    if !is_html {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => bytes::Bytes::new(),
    };
    let html = String::from_utf8_lossy(&bytes);
    let mut wrapped = Response::new(full_body(snippets::embed_document(&html)));
    *wrapped.status_mut() = parts.status;
    set_js_content_type(&mut wrapped);
    wrapped
}

fn paths_equivalent(a: &str, b: &str) -> bool {
    let norm = |p: &str| {
        let trimmed = p.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }.to_string()
    };
    norm(a) == norm(b)
}

fn not_found_page() -> Response<SvcBody> {
    let mut response = Response::new(full_body(NOT_FOUND_PAGE));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    apply_accept_ch(response.headers_mut());
    response
}

fn set_js_content_type(response: &mut Response<SvcBody>) {
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/javascript; charset=utf-8"),
    );
}

fn query_map(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
