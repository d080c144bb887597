//! Request enrichment: the per-request immutable context everything
//! downstream matches on, substitutes from, and records into events.
//!
//! The TLS-terminating edge annotates each request with geo, bot, and
//! transport metadata headers; user-agent fields come from the parser
//! and are overridden by Client Hints when the browser sends them. For
//! `/track.js?url=...` the effective host/path/query are adopted from
//! the embedded URL, so the rest of the engine never needs to know it
//! is running in embed mode.

use crate::errors::{DispatchError, Result};
use crate::fingerprint;
use crate::pages;
use crate::ua::{UaInfo, UserAgentParser};
use http::request::Parts;
use std::collections::HashMap;
use url::Url;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EdgeInfo {
    pub asn: Option<u32>,
    pub colo: Option<String>,
    pub trust_score: Option<i64>,
    pub bot_score: Option<i64>,
    pub verified_bot: bool,
    pub http_protocol: Option<String>,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub host: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// The query string as received, for upstream passthrough.
    pub raw_query: Option<String>,
    /// Lowercased names in wire order; feeds the fingerprint.
    pub headers: Vec<(String, String)>,
    pub ip: String,
    /// AS organization reported by the edge.
    pub org: Option<String>,
    pub referrer: Option<String>,
    pub is_embed: bool,
    pub session_id: String,
    /// Carried on click-out requests to link back to the impression.
    pub impression_id: Option<String>,
    pub ua: UaInfo,
    pub geo: GeoInfo,
    pub edge: EdgeInfo,
    pub is_bot: bool,
}

/// Prefetch/prerender requests are answered 204 before any dispatch.
pub fn is_prefetch(parts: &Parts) -> bool {
    for name in ["sec-purpose", "purpose"] {
        if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.to_ascii_lowercase();
            if value.contains("prefetch") || value.contains("prerender") {
                return true;
            }
        }
    }
    false
}

pub const TRACK_JS_PATH: &str = "/track.js";

fn strip_quotes(value: &str) -> &str {
    value.trim_matches('"')
}

/// Picks the marketable brand out of a `sec-ch-ua` list, skipping the
/// GREASE entries and the bare Chromium token when a branded one exists.
fn browser_from_client_hints(value: &str) -> Option<(String, Option<String>)> {
    let mut chromium: Option<(String, Option<String>)> = None;
    for entry in value.split(',') {
        let mut parts = entry.trim().splitn(2, ';');
        let brand = strip_quotes(parts.next()?.trim()).to_string();
        if brand.contains("Not") || brand.contains("Brand") {
            continue;
        }
        let version = parts
            .next()
            .and_then(|v| v.trim().strip_prefix("v="))
            .map(|v| strip_quotes(v).to_string());
        if brand == "Chromium" {
            chromium = Some((brand, version));
        } else {
            return Some((brand, version));
        }
    }
    chromium
}

impl RequestContext {
    pub fn from_parts(parts: &Parts, ua_parser: &dyn UserAgentParser) -> Result<Self> {
        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let header = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };

        let mut host = header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        let mut path = parts.uri.path().to_string();
        let mut raw_query = parts.uri.query().map(str::to_string);

        let mut is_embed = false;
        if path == TRACK_JS_PATH {
            let embed_url = parse_query(raw_query.as_deref())
                .remove("url")
                .ok_or(DispatchError::InvalidEmbedUrl)?;
            let parsed = Url::parse(&embed_url).map_err(|_| DispatchError::InvalidEmbedUrl)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(DispatchError::InvalidEmbedUrl);
            }
            host = parsed
                .host_str()
                .ok_or(DispatchError::InvalidEmbedUrl)?
                .to_string();
            path = parsed.path().to_string();
            raw_query = parsed.query().map(str::to_string);
            is_embed = true;
        }

        let query = parse_query(raw_query.as_deref());

        let raw_ua = header("user-agent").unwrap_or("");
        let mut ua = ua_parser.parse(raw_ua);
        apply_client_hints(&mut ua, &header);

        let ip = header("cf-connecting-ip")
            .or_else(|| header("x-real-ip"))
            .unwrap_or("")
            .to_string();

        let geo = GeoInfo {
            country: header("cf-ipcountry").map(str::to_string),
            region: header("cf-region").map(str::to_string),
            region_code: header("cf-region-code").map(str::to_string),
            city: header("cf-ipcity").map(str::to_string),
            continent: header("cf-ipcontinent").map(str::to_string),
            lat: header("cf-iplatitude").and_then(|v| v.parse().ok()),
            lon: header("cf-iplongitude").and_then(|v| v.parse().ok()),
            timezone: header("cf-timezone").map(str::to_string),
            postal_code: header("cf-postal-code").map(str::to_string),
        };

        let edge = EdgeInfo {
            asn: header("cf-asn").and_then(|v| v.parse().ok()),
            colo: header("cf-colo").map(str::to_string),
            trust_score: header("cf-trust-score").and_then(|v| v.parse().ok()),
            bot_score: header("cf-bot-score").and_then(|v| v.parse().ok()),
            verified_bot: header("cf-verified-bot") == Some("true"),
            http_protocol: header("cf-http-protocol").map(str::to_string),
            tls_version: header("cf-tls-version").map(str::to_string),
            tls_cipher: header("cf-tls-cipher").map(str::to_string),
        };

        // Bot verdict is the OR of every upstream signal.
        let is_bot = ua_parser.is_bot(raw_ua)
            || edge.bot_score.is_some_and(|s| s < 30)
            || edge.trust_score.is_some_and(|s| s > 50)
            || edge.verified_bot;

        let session_id = fingerprint::session_id(
            &ip,
            edge.tls_cipher.as_deref().unwrap_or(""),
            edge.http_protocol.as_deref().unwrap_or(""),
            &headers,
        );

        let impression_id = query.get("impression_id").cloned();
        let org = header("cf-asorganization").map(str::to_string);
        let referrer = header("referer").map(str::to_string);

        Ok(RequestContext {
            host,
            path,
            query,
            raw_query,
            headers,
            ip,
            org,
            referrer,
            is_embed,
            session_id,
            impression_id,
            ua,
            geo,
            edge,
            is_bot,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_page_like(&self) -> bool {
        pages::is_page_like(&self.path)
    }

    /// Primary subtag of `accept-language` ("en-US,en;q=0.9" → "en").
    pub fn language(&self) -> Option<String> {
        let value = self.header("accept-language")?;
        let primary = value.split(',').next()?.trim();
        let subtag = primary.split(['-', ';']).next()?.trim();
        if subtag.is_empty() {
            None
        } else {
            Some(subtag.to_ascii_lowercase())
        }
    }
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn apply_client_hints<'a>(ua: &mut UaInfo, header: &impl Fn(&str) -> Option<&'a str>) {
    if let Some(value) = header("sec-ch-ua")
        && let Some((brand, version)) = browser_from_client_hints(value)
    {
        ua.browser = Some(brand);
        if version.is_some() {
            ua.version = version;
        }
    }
    if let Some(platform) = header("sec-ch-ua-platform") {
        let platform = strip_quotes(platform);
        if !platform.is_empty() {
            ua.os = Some(platform.to_string());
        }
    }
    if let Some(version) = header("sec-ch-ua-platform-version") {
        let version = strip_quotes(version);
        if !version.is_empty() {
            ua.os_version = Some(version.to_string());
        }
    }
    if let Some(mobile) = header("sec-ch-ua-mobile") {
        match mobile {
            "?1" => ua.device = Some("mobile".to_string()),
            "?0" => ua.device = Some("desktop".to_string()),
            _ => {}
        }
    }
    if let Some(model) = header("sec-ch-ua-model") {
        let model = strip_quotes(model);
        if !model.is_empty() {
            ua.model = Some(model.to_string());
        }
    }
    if let Some(arch) = header("sec-ch-ua-arch") {
        let arch = strip_quotes(arch);
        if !arch.is_empty() {
            ua.arch = Some(arch.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ua::HeuristicUaParser;
    use http::Request;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn builds_context_from_edge_headers() {
        let parts = parts_for(
            "/products/item?utm_source=fb",
            &[
                ("host", "shop.example:443"),
                ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0 Safari/537.36"),
                ("cf-connecting-ip", "203.0.113.7"),
                ("cf-ipcountry", "US"),
                ("cf-ipcity", "Austin"),
                ("cf-asn", "13335"),
                ("cf-bot-score", "95"),
                ("cf-tls-cipher", "TLS_AES_128_GCM_SHA256"),
            ],
        );

        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert_eq!(ctx.host, "shop.example");
        assert_eq!(ctx.path, "/products/item");
        assert_eq!(ctx.query["utm_source"], "fb");
        assert_eq!(ctx.geo.country.as_deref(), Some("US"));
        assert_eq!(ctx.edge.asn, Some(13335));
        assert!(!ctx.is_bot);
        assert_eq!(ctx.session_id.len(), 8);
    }

    #[test]
    fn embed_mode_adopts_the_target_url() {
        let parts = parts_for(
            "/track.js?url=https%3A%2F%2Fshop.example%2Flp%3Fgclid%3DG",
            &[("host", "edge.example")],
        );

        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert!(ctx.is_embed);
        assert_eq!(ctx.host, "shop.example");
        assert_eq!(ctx.path, "/lp");
        assert_eq!(ctx.query["gclid"], "G");
    }

    #[test]
    fn embed_mode_rejects_bad_urls() {
        for uri in [
            "/track.js",
            "/track.js?url=not-a-url",
            "/track.js?url=ftp%3A%2F%2Fx.example%2F",
        ] {
            let parts = parts_for(uri, &[("host", "edge.example")]);
            assert!(matches!(
                RequestContext::from_parts(&parts, &HeuristicUaParser),
                Err(DispatchError::InvalidEmbedUrl)
            ));
        }
    }

    #[test]
    fn low_bot_score_marks_bot() {
        let parts = parts_for(
            "/",
            &[
                ("host", "shop.example"),
                ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0 Safari/537.36"),
                ("cf-bot-score", "10"),
            ],
        );
        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert!(ctx.is_bot);
    }

    #[test]
    fn verified_bot_marks_bot() {
        let parts = parts_for(
            "/",
            &[("host", "shop.example"), ("cf-verified-bot", "true")],
        );
        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert!(ctx.is_bot);
    }

    #[test]
    fn client_hints_override_ua_fields() {
        let parts = parts_for(
            "/",
            &[
                ("host", "shop.example"),
                ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0 Safari/537.36"),
                ("sec-ch-ua", "\"Not/A)Brand\";v=\"8\", \"Chromium\";v=\"126\", \"Google Chrome\";v=\"126\""),
                ("sec-ch-ua-platform", "\"Windows\""),
                ("sec-ch-ua-platform-version", "\"15.0.0\""),
                ("sec-ch-ua-mobile", "?0"),
                ("sec-ch-ua-model", "\"\""),
                ("sec-ch-ua-arch", "\"x86\""),
            ],
        );

        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert_eq!(ctx.ua.browser.as_deref(), Some("Google Chrome"));
        assert_eq!(ctx.ua.os.as_deref(), Some("Windows"));
        assert_eq!(ctx.ua.os_version.as_deref(), Some("15.0.0"));
        assert_eq!(ctx.ua.device.as_deref(), Some("desktop"));
        assert_eq!(ctx.ua.arch.as_deref(), Some("x86"));
        assert_eq!(ctx.ua.model, None);
    }

    #[test]
    fn prefetch_detection_reads_both_purpose_headers() {
        let prefetch = parts_for("/", &[("sec-purpose", "prefetch;prerender")]);
        assert!(is_prefetch(&prefetch));

        let legacy = parts_for("/", &[("purpose", "prefetch")]);
        assert!(is_prefetch(&legacy));

        let normal = parts_for("/", &[("host", "x")]);
        assert!(!is_prefetch(&normal));
    }

    #[test]
    fn language_takes_the_primary_subtag() {
        let parts = parts_for(
            "/",
            &[("host", "x"), ("accept-language", "en-US,en;q=0.9,de;q=0.8")],
        );
        let ctx = RequestContext::from_parts(&parts, &HeuristicUaParser).unwrap();
        assert_eq!(ctx.language().as_deref(), Some("en"));
    }
}
