//! `{{token}}` macro expansion for landing pages, CSS, and redirect
//! URLs.
//!
//! The table is materialized once per request into an immutable map
//! keyed by lowercase token name; expansion never mutates it. URL
//! expansion percent-encodes each substituted value, HTML/CSS insert
//! raw. `{{!name}}` is the escape form and always survives as
//! `{{name}}`; unknown tokens are left verbatim.

use crate::bundle::RuleBundle;
use crate::context::RequestContext;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use stores::platform_cache::PlatformAttribution;

static ESCAPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*!\s*([^{}]*?)\s*\}\}").unwrap());
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

// Private-use sentinels protect escaped tokens during the replace pass.
const GUARD_OPEN: char = '\u{e000}';
const GUARD_CLOSE: char = '\u{e001}';

/// Inputs the table draws from beyond the request context itself.
#[derive(Default)]
pub struct MacroInputs<'a> {
    pub bundle: Option<&'a RuleBundle>,
    pub rule_variables: Option<&'a HashMap<String, String>>,
    pub click_id: Option<&'a str>,
    pub impression_id: Option<&'a str>,
    pub platform: Option<&'a PlatformAttribution>,
    pub platform_click_id: Option<&'a str>,
}

pub struct MacroTable {
    map: HashMap<String, String>,
}

impl MacroTable {
    pub fn build(ctx: &RequestContext, inputs: &MacroInputs<'_>) -> Self {
        let mut map = HashMap::new();
        let mut set = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                map.insert(key.to_ascii_lowercase(), value);
            }
        };

        set("user.ip", Some(ctx.ip.clone()));
        set("user.city", ctx.geo.city.clone());
        set("user.country", ctx.geo.country.clone());
        set("user.continent", ctx.geo.continent.clone());
        set("user.region", ctx.geo.region.clone());
        set("user.regionCode", ctx.geo.region_code.clone());
        set("user.postalCode", ctx.geo.postal_code.clone());
        set("user.lat", ctx.geo.lat.map(|v| v.to_string()));
        set("user.long", ctx.geo.lon.map(|v| v.to_string()));
        set("user.timezone", ctx.geo.timezone.clone());
        set("user.device", ctx.ua.device.clone());
        set("user.browser", ctx.ua.browser.clone());
        set("user.browserVersion", ctx.ua.version.clone());
        set("user.os", ctx.ua.os.clone());
        set("user.osVersion", ctx.ua.os_version.clone());
        set("user.brand", ctx.ua.brand.clone());
        set("user.model", ctx.ua.model.clone());
        set("user.arch", ctx.ua.arch.clone());
        set("user.bot_score", ctx.edge.bot_score.map(|v| v.to_string()));
        set("user.threat_score", ctx.edge.trust_score.map(|v| v.to_string()));
        set(
            "user.is_verified_bot",
            Some(ctx.edge.verified_bot.to_string()),
        );
        set("user.organization", ctx.org.clone());
        set("user.referrer", ctx.referrer.clone());
        // The transport metadata carries the colo only as a bare code,
        // so the code doubles as its name and the location detail
        // tokens resolve from the visitor geo fields.
        set("user.colo", ctx.edge.colo.clone());
        set("user.colo.name", ctx.edge.colo.clone());
        set("user.colo.city", ctx.geo.city.clone());
        set("user.colo.country", ctx.geo.country.clone());
        set("user.colo.region", ctx.geo.region.clone());
        set("user.asn", ctx.edge.asn.map(|v| v.to_string()));

        set("request.domain", Some(ctx.host.clone()));
        set("request.path", Some(ctx.path.clone()));

        for (key, value) in &ctx.query {
            let sanitized: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect();
            set(&format!("query.{sanitized}"), Some(value.clone()));
        }

        if let Some(bundle) = inputs.bundle {
            set("campaign.id", Some(bundle.id.clone()));
            set("campaign.name", bundle.name.clone());
            set("site.name", bundle.site_name.clone());
            for (key, value) in &bundle.variables {
                set(key, Some(value.clone()));
            }
        }
        // Rule variables shadow bundle variables.
        if let Some(variables) = inputs.rule_variables {
            for (key, value) in variables {
                set(key, Some(value.clone()));
            }
        }

        set("session.id", Some(ctx.session_id.clone()));
        set("click.id", inputs.click_id.map(str::to_string));
        set("impression.id", inputs.impression_id.map(str::to_string));
        if let Some(platform) = inputs.platform {
            set("platform.id", Some(platform.platform_id.clone()));
            set("platform.name", Some(platform.platform_name.clone()));
        }
        set(
            "platform.click_id",
            inputs.platform_click_id.map(str::to_string),
        );

        MacroTable { map }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        MacroTable {
            map: pairs
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        }
    }

    /// Raw insertion, for HTML and CSS bodies.
    pub fn expand_text(&self, input: &str) -> String {
        self.expand(input, false)
    }

    /// Percent-encodes each substituted value, for URLs.
    pub fn expand_url(&self, input: &str) -> String {
        self.expand(input, true)
    }

    fn expand(&self, input: &str, encode: bool) -> String {
        if !input.contains("{{") {
            return input.to_string();
        }

        // Protect escapes, substitute, then restore escapes unescaped.
        let mut guarded: Vec<String> = Vec::new();
        let protected = ESCAPED.replace_all(input, |caps: &regex::Captures<'_>| {
            guarded.push(caps[1].to_string());
            format!("{GUARD_OPEN}{}{GUARD_CLOSE}", guarded.len() - 1)
        });

        let replaced = TOKEN.replace_all(&protected, |caps: &regex::Captures<'_>| {
            match self.map.get(&caps[1].to_ascii_lowercase()) {
                Some(value) if encode => {
                    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
                }
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        });

        let mut output = replaced.into_owned();
        for (index, name) in guarded.iter().enumerate() {
            output = output.replace(
                &format!("{GUARD_OPEN}{index}{GUARD_CLOSE}"),
                &format!("{{{{{name}}}}}"),
            );
        }
        output
    }
}
