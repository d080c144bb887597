//! Click-out handling: paths ending in `/click` never serve content,
//! they resolve a click destination, link the click to its impression,
//! and answer with a 302.
//!
//! The impression lookback recovers the landing page and the original
//! query string, which is merged under the current query so ad-network
//! click ids captured at impression time survive into the redirect.

use crate::bundle::RuleBundle;
use crate::context::RequestContext;
use crate::errors::Result;
use crate::events::{EventEmitter, EventSeed};
use crate::fingerprint;
use crate::macros::{MacroInputs, MacroTable};
use crate::matcher::RuleMatch;
use crate::selector;
use http::StatusCode;
use http::header::{HeaderValue, LOCATION};
use hyper::Response;
use rand::Rng;
use shared::http::{SvcBody, apply_no_store, full_body};
use std::collections::HashMap;
use std::sync::Arc;
use stores::dest_cache::DestinationCache;
use stores::events::EventStore;
use stores::platform_cache::PlatformAttribution;
use url::Url;

/// True when the final path segment is `click`, with or without a
/// trailing slash.
pub fn is_click_path(path: &str) -> bool {
    path.trim_end_matches('/').rsplit('/').next() == Some("click")
}

pub struct ClickDeps<'a> {
    pub dest_cache: &'a DestinationCache,
    pub events: &'a Arc<dyn EventStore>,
    pub emitter: &'a EventEmitter,
    pub platform: Option<&'a PlatformAttribution>,
    pub platform_click_id: Option<&'a str>,
}

/// Resolves and serves a click-out. Returns None when no click action
/// applies, letting the caller fall through to regular dispatch.
pub async fn handle<R: Rng + ?Sized>(
    ctx: &RequestContext,
    bundle: &RuleBundle,
    matches: &[RuleMatch<'_>],
    deps: &ClickDeps<'_>,
    rng: &mut R,
) -> Result<Option<Response<SvcBody>>> {
    let (target, destination_id, matched_flags) =
        match select_click_target(bundle, matches, deps, rng).await {
            Some(resolved) => resolved,
            None => return Ok(None),
        };

    let click_id = fingerprint::new_event_id();
    let impression_id = ctx
        .impression_id
        .clone()
        .unwrap_or_else(fingerprint::new_event_id);

    // Recover the impression's landing page and original query; the
    // current query wins on conflicts.
    let lookback = deps.events.find_impression(&impression_id).await?;
    let mut merged_query: HashMap<String, String> = lookback
        .as_ref()
        .map(|imp| imp.query.clone())
        .unwrap_or_default();
    merged_query.extend(ctx.query.clone());

    let mut merged_ctx = ctx.clone();
    merged_ctx.query = merged_query.clone();

    let macros = MacroTable::build(
        &merged_ctx,
        &MacroInputs {
            bundle: Some(bundle),
            rule_variables: None,
            click_id: Some(&click_id),
            impression_id: Some(&impression_id),
            platform: deps.platform,
            platform_click_id: deps.platform_click_id,
        },
    );

    let location = match build_click_url(
        &target,
        &macros,
        &merged_query,
        &click_id,
        &impression_id,
        &ctx.session_id,
    ) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(target, error = %e, "unusable click destination");
            return Ok(None);
        }
    };

    let mut response = Response::new(full_body(Vec::new()));
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    apply_no_store(response.headers_mut());

    let seed = EventSeed {
        ctx: &merged_ctx,
        campaign_id: &bundle.id,
        campaign_name: bundle.name.as_deref(),
        site_name: bundle.site_name.as_deref(),
        platform: deps.platform,
        platform_click_id: deps.platform_click_id,
    };
    let mut event = seed.event(click_id.clone());
    event.is_click = true;
    event.click_id = Some(click_id);
    event.impression_id = Some(impression_id);
    event.destination_url = Some(location);
    event.destination_id = destination_id;
    event.matched_flags = matched_flags;
    if let Some(imp) = lookback {
        event.landing_page = imp.landing_page;
        event.landing_page_mode = imp.landing_page_mode;
    }
    deps.emitter.emit(event);

    Ok(Some(response))
}

/// Picks the click destination: a weighted rule, then a weighted
/// destination within it; inactive destinations are skipped, and the
/// bundle's root destination id is the last resort.
async fn select_click_target<R: Rng + ?Sized>(
    bundle: &RuleBundle,
    matches: &[RuleMatch<'_>],
    deps: &ClickDeps<'_>,
    rng: &mut R,
) -> Option<(String, Option<String>, Option<Vec<String>>)> {
    let click_matches: Vec<&RuleMatch<'_>> =
        matches.iter().filter(|m| m.rule.has_click_action()).collect();

    if let Some(picked) = selector::pick(
        &click_matches,
        |m| u64::from(m.rule.effective_weight()),
        rng,
    ) {
        let rule = picked.rule;
        let flags = Some(picked.matched_flags.clone());

        if !rule.click_destinations.is_empty() {
            // Re-select among the remaining candidates when a
            // destination turns out inactive.
            let mut candidates: Vec<_> = rule.click_destinations.iter().collect();
            while !candidates.is_empty() {
                let index = selector::pick_index(
                    &candidates
                        .iter()
                        .map(|d| u64::from(d.weight.unwrap_or(1)))
                        .collect::<Vec<_>>(),
                    rng,
                )?;
                let dest = candidates.remove(index);
                if let Some(url) = &dest.url {
                    return Some((url.clone(), None, flags));
                }
                if let Some(id) = &dest.id
                    && let Some(url) = deps.dest_cache.resolve(id).await
                {
                    return Some((url, Some(id.clone()), flags));
                }
            }
        }
        if let Some(url) = &rule.click_url {
            return Some((url.clone(), None, flags));
        }
    }

    // Root-level destination id paired with a default folder.
    if let Some(id) = &bundle.destination_id
        && bundle.default_folder.is_some()
        && let Some(url) = deps.dest_cache.resolve(id).await
    {
        return Some((url, Some(id.clone()), None));
    }
    None
}

/// Expands macros, rebuilds the URL, appends the merged query, and
/// stamps the tracking ids last so they cannot be shadowed.
fn build_click_url(
    target: &str,
    macros: &MacroTable,
    merged_query: &HashMap<String, String>,
    click_id: &str,
    impression_id: &str,
    session_id: &str,
) -> Result<String, url::ParseError> {
    const RESERVED: [&str; 3] = ["click_id", "impression_id", "session_id"];

    let expanded = macros.expand_url(target);
    let mut url = Url::parse(&expanded)?;

    let existing: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !RESERVED.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in existing {
            pairs.append_pair(&key, &value);
        }
        for (key, value) in merged_query {
            if !RESERVED.contains(&key.as_str()) {
                pairs.append_pair(key, value);
            }
        }
        pairs.append_pair("click_id", click_id);
        pairs.append_pair("impression_id", impression_id);
        pairs.append_pair("session_id", session_id);
    }
    Ok(url.to_string())
}
