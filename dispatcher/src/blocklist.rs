//! Deny lists evaluated before rule matching. A hit bypasses matching
//! entirely and the request is served the bundle's default landing in
//! its configured mode. Detected bots take the same route.

use crate::bundle::BlockSet;
use crate::context::RequestContext;
use crate::matcher::{glob_match, ip_matches};

/// Returns the name of the first deny list the request hits.
pub fn block_reason(blocks: &BlockSet, ctx: &RequestContext) -> Option<&'static str> {
    if !ctx.ip.is_empty() && blocks.ips.iter().any(|p| ip_matches(p, &ctx.ip)) {
        return Some("ip");
    }
    if hits(&blocks.orgs, ctx.org.as_deref(), glob_match) {
        return Some("org");
    }
    if hits(&blocks.hostnames, Some(&ctx.host), glob_match) {
        return Some("hostname");
    }
    if hits(&blocks.cities, ctx.geo.city.as_deref(), glob_match) {
        return Some("city");
    }
    if hits(&blocks.countries, ctx.geo.country.as_deref(), |p, v| {
        p.eq_ignore_ascii_case(v)
    }) {
        return Some("country");
    }
    if hits(&blocks.devices, ctx.ua.device.as_deref(), |p, v| {
        p.eq_ignore_ascii_case(v)
    }) {
        return Some("device");
    }
    if hits(&blocks.browsers, ctx.ua.browser.as_deref(), glob_match) {
        return Some("browser");
    }
    if hits(&blocks.oses, ctx.ua.os.as_deref(), glob_match) {
        return Some("os");
    }
    None
}

fn hits(patterns: &[String], value: Option<&str>, matches: impl Fn(&str, &str) -> bool) -> bool {
    let Some(value) = value else {
        return false;
    };
    patterns.iter().any(|p| matches(p, value))
}
