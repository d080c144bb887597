//! The condition language: evaluates a rule's flag sets against the
//! enriched request context.
//!
//! Semantics: fields AND across one another, a list value is an OR
//! within the field, and a missing field is "don't care". `groups` is a
//! disjunction of flag sets and shadows the legacy single `flags`.
//! Query-parameter predicates only apply to page-like requests; on
//! assets they are false, and a second pass with `params` stripped lets
//! an asset inherit its landing page's rule.

use crate::bundle::{FlagSet, Rule, TimeWindow};
use crate::context::RequestContext;
use crate::pages;
use std::net::Ipv4Addr;

#[derive(Clone, Debug)]
pub struct MatchOptions {
    /// Current UTC time as fractional hours (14.5 = 14:30).
    pub now_fractional_hour: f64,
    /// Whether an inverted `time` window (start > end) wraps midnight.
    pub wrap_midnight: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        let now = chrono::Utc::now();
        use chrono::Timelike;
        MatchOptions {
            now_fractional_hour: f64::from(now.hour())
                + f64::from(now.minute()) / 60.0
                + f64::from(now.second()) / 3600.0,
            wrap_midnight: false,
        }
    }
}

/// A rule that matched, with human-readable descriptors of the flags
/// that fired (logged, and recorded on click events).
#[derive(Debug)]
pub struct RuleMatch<'a> {
    pub index: usize,
    pub rule: &'a Rule,
    pub matched_flags: Vec<String>,
}

/// Evaluates every rule, applying the asset-inheritance fallback when
/// nothing matches an asset request directly.
pub fn matching_rules<'a>(
    rules: &'a [Rule],
    ctx: &RequestContext,
    opts: &MatchOptions,
) -> Vec<RuleMatch<'a>> {
    let matches = collect_matches(rules, ctx, opts, false);
    if !matches.is_empty() || !pages::is_asset(&ctx.path) {
        return matches;
    }
    collect_matches(rules, ctx, opts, true)
}

fn collect_matches<'a>(
    rules: &'a [Rule],
    ctx: &RequestContext,
    opts: &MatchOptions,
    ignore_params: bool,
) -> Vec<RuleMatch<'a>> {
    rules
        .iter()
        .enumerate()
        .filter_map(|(index, rule)| {
            rule_matches(rule, ctx, opts, ignore_params).map(|matched_flags| RuleMatch {
                index,
                rule,
                matched_flags,
            })
        })
        .collect()
}

pub fn rule_matches(
    rule: &Rule,
    ctx: &RequestContext,
    opts: &MatchOptions,
    ignore_params: bool,
) -> Option<Vec<String>> {
    if !rule.groups.is_empty() {
        return rule
            .groups
            .iter()
            .find_map(|group| flag_set_matches(group, ctx, opts, ignore_params));
    }
    match &rule.flags {
        Some(flags) => flag_set_matches(flags, ctx, opts, ignore_params),
        // A rule with no conditions matches every request.
        None => Some(Vec::new()),
    }
}

fn flag_set_matches(
    flags: &FlagSet,
    ctx: &RequestContext,
    opts: &MatchOptions,
    ignore_params: bool,
) -> Option<Vec<String>> {
    let mut matched = Vec::new();

    check_list(&flags.country, ctx.geo.country.as_deref(), eq_fold, "country", &mut matched)?;
    check_list(&flags.region, ctx.geo.region.as_deref(), eq_fold, "region", &mut matched)?;
    check_list(&flags.city, ctx.geo.city.as_deref(), eq_fold, "city", &mut matched)?;
    check_list(
        &flags.continent,
        ctx.geo.continent.as_deref(),
        eq_fold,
        "continent",
        &mut matched,
    )?;
    let asn = ctx.edge.asn.map(|a| a.to_string());
    check_list(&flags.asn, asn.as_deref(), eq_fold, "asn", &mut matched)?;
    check_list(&flags.colo, ctx.edge.colo.as_deref(), eq_fold, "colo", &mut matched)?;
    check_list(
        &flags.ip,
        if ctx.ip.is_empty() { None } else { Some(ctx.ip.as_str()) },
        |pattern, ip| ip_matches(pattern, ip),
        "ip",
        &mut matched,
    )?;
    check_list(&flags.org, ctx.org.as_deref(), glob_match, "org", &mut matched)?;
    let language = ctx.language();
    check_list(&flags.language, language.as_deref(), eq_fold, "language", &mut matched)?;
    check_list(&flags.device, ctx.ua.device.as_deref(), eq_fold, "device", &mut matched)?;
    check_list(&flags.browser, ctx.ua.browser.as_deref(), eq_fold, "browser", &mut matched)?;
    check_list(
        &flags.os,
        ctx.ua.os.as_deref(),
        |pattern, os| os.to_ascii_lowercase().contains(&pattern.to_ascii_lowercase()),
        "os",
        &mut matched,
    )?;
    check_list(&flags.brand, ctx.ua.brand.as_deref(), eq_fold, "brand", &mut matched)?;

    if let Some(window) = &flags.time {
        if !time_matches(window, opts.now_fractional_hour, opts.wrap_midnight) {
            return None;
        }
        matched.push(format!("time={}-{}", window.start, window.end));
    }

    if !flags.params.is_empty() && !ignore_params {
        // Query predicates never match asset requests.
        if !pages::is_page_like(&ctx.path) {
            return None;
        }
        for (key, expected) in &flags.params {
            if ctx.query.get(key) != Some(expected) {
                return None;
            }
            matched.push(format!("params.{key}={expected}"));
        }
    }

    Some(matched)
}

/// One OR-list field: passes when empty, or when any element matches
/// the context value through `matches`.
fn check_list(
    patterns: &[String],
    value: Option<&str>,
    matches: impl Fn(&str, &str) -> bool,
    label: &str,
    matched: &mut Vec<String>,
) -> Option<()> {
    if patterns.is_empty() {
        return Some(());
    }
    let value = value?;
    let hit = patterns.iter().find(|p| matches(p.as_str(), value))?;
    matched.push(format!("{label}={hit}"));
    Some(())
}

fn eq_fold(pattern: &str, value: &str) -> bool {
    pattern.eq_ignore_ascii_case(value)
}

fn time_matches(window: &TimeWindow, now: f64, wrap_midnight: bool) -> bool {
    if wrap_midnight && window.start > window.end {
        now >= window.start || now < window.end
    } else {
        window.start <= now && now < window.end
    }
}

/// Case-insensitive glob where `*` matches any run of characters.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let value = value.to_ascii_lowercase();

    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value.as_str();

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// IP predicate: exact, IPv4 CIDR, hyphenated IPv4 range, or glob.
pub fn ip_matches(pattern: &str, ip: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('/') {
        let (Ok(net), Ok(addr)) = (
            pattern.parse::<ipnet::IpNet>(),
            ip.parse::<std::net::IpAddr>(),
        ) else {
            return false;
        };
        return net.contains(&addr);
    }
    if let Some((lo, hi)) = pattern.split_once('-')
        && let (Ok(lo), Ok(hi), Ok(addr)) = (
            lo.trim().parse::<Ipv4Addr>(),
            hi.trim().parse::<Ipv4Addr>(),
            ip.parse::<Ipv4Addr>(),
        )
    {
        let (lo, hi, addr) = (u32::from(lo), u32::from(hi), u32::from(addr));
        return lo <= addr && addr <= hi;
    }
    if pattern.contains('*') {
        return glob_match(pattern, ip);
    }
    pattern == ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{ctx_with, page_ctx};
    use serde_json::json;

    fn rule(value: serde_json::Value) -> Rule {
        serde_json::from_value(value).unwrap()
    }

    fn opts() -> MatchOptions {
        MatchOptions {
            now_fractional_hour: 12.0,
            wrap_midnight: false,
        }
    }

    #[test]
    fn fields_and_across_lists_or_within() {
        let rule = rule(json!({
            "flags": {"country": ["US", "CA"], "device": "mobile"},
            "folder": "lp/"
        }));

        let mut ctx = page_ctx();
        ctx.geo.country = Some("CA".into());
        ctx.ua.device = Some("mobile".into());
        let flags = rule_matches(&rule, &ctx, &opts(), false).unwrap();
        assert_eq!(flags, vec!["country=CA", "device=mobile"]);

        ctx.ua.device = Some("desktop".into());
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_none());
    }

    #[test]
    fn missing_context_value_fails_a_present_field() {
        let rule = rule(json!({"flags": {"country": "US"}}));
        let mut ctx = page_ctx();
        ctx.geo.country = None;
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_none());
    }

    #[test]
    fn groups_are_a_disjunction_and_shadow_flags() {
        let rule = rule(json!({
            "flags": {"country": "DE"},
            "groups": [
                {"country": "US"},
                {"device": "mobile"}
            ]
        }));

        let mut ctx = page_ctx();
        ctx.geo.country = Some("FR".into());
        ctx.ua.device = Some("mobile".into());
        // flags would reject; the second group accepts.
        let flags = rule_matches(&rule, &ctx, &opts(), false).unwrap();
        assert_eq!(flags, vec!["device=mobile"]);
    }

    #[test]
    fn rule_without_conditions_matches_everything() {
        let rule = rule(json!({"folder": "lp/"}));
        assert!(rule_matches(&rule, &page_ctx(), &opts(), false).is_some());
    }

    #[test]
    fn cidr_range_and_wildcard_ip_predicates() {
        assert!(ip_matches("1.2.3.0/24", "1.2.3.255"));
        assert!(!ip_matches("1.2.3.0/24", "1.2.4.0"));
        assert!(ip_matches("10.0.0.5-10.0.0.9", "10.0.0.7"));
        assert!(!ip_matches("10.0.0.5-10.0.0.9", "10.0.0.10"));
        assert!(ip_matches("192.168.*", "192.168.44.1"));
        assert!(ip_matches("*", "anything"));
        assert!(ip_matches("203.0.113.7", "203.0.113.7"));
        assert!(!ip_matches("not-a-range-1.2.3.4", "1.2.3.4"));
    }

    #[test]
    fn org_uses_case_insensitive_globs() {
        let rule = rule(json!({"flags": {"org": "*amazon*"}}));
        let mut ctx = page_ctx();
        ctx.org = Some("AMAZON-02".into());
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_some());

        ctx.org = Some("Cloudflare".into());
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_none());
    }

    #[test]
    fn os_matches_by_substring() {
        let rule = rule(json!({"flags": {"os": "mac"}}));
        let mut ctx = page_ctx();
        ctx.ua.os = Some("macOS".into());
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_some());
    }

    #[test]
    fn time_window_is_half_open() {
        let window = TimeWindow { start: 9.0, end: 17.0 };
        assert!(time_matches(&window, 9.0, false));
        assert!(time_matches(&window, 16.99, false));
        assert!(!time_matches(&window, 17.0, false));
        assert!(!time_matches(&window, 3.0, false));
    }

    #[test]
    fn inverted_time_window_needs_wrap_enabled() {
        let window = TimeWindow { start: 22.0, end: 2.0 };
        // Without wrap the comparison can never hold.
        assert!(!time_matches(&window, 23.0, false));
        assert!(!time_matches(&window, 1.0, false));
        // With wrap it spans midnight.
        assert!(time_matches(&window, 23.0, true));
        assert!(time_matches(&window, 1.0, true));
        assert!(!time_matches(&window, 12.0, true));
    }

    #[test]
    fn params_never_match_asset_requests() {
        let rule = rule(json!({"flags": {"params": {"utm": "x"}}}));
        let ctx = ctx_with("/styles/main.css", &[("utm", "x")]);
        assert!(rule_matches(&rule, &ctx, &opts(), false).is_none());

        let page = ctx_with("/lp/", &[("utm", "x")]);
        assert!(rule_matches(&rule, &page, &opts(), false).is_some());
    }

    #[test]
    fn assets_inherit_rules_once_params_are_stripped() {
        let rules = vec![rule(json!({
            "flags": {"country": "US", "params": {"utm": "x"}},
            "folder": "lp/"
        }))];

        let mut asset = ctx_with("/styles/main.css", &[]);
        asset.geo.country = Some("US".into());

        let matches = matching_rules(&rules, &asset, &opts());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_flags, vec!["country=US"]);

        // A page request with the wrong params does NOT inherit.
        let mut page = ctx_with("/lp/", &[]);
        page.geo.country = Some("US".into());
        assert!(matching_rules(&rules, &page, &opts()).is_empty());
    }

    #[test]
    fn glob_edges() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("comcast*", "Comcast Cable"));
        assert!(glob_match("*cable", "comcast cable"));
        assert!(glob_match("com*ble", "comcast cable"));
        assert!(!glob_match("com*ble", "verizon fios"));
        assert!(glob_match("exact", "EXACT"));
    }
}
