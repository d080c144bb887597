//! Transparent upstream proxying: fetch the chosen base URL, rewrite
//! the document so it works from our origin, expand macros, and inject
//! the device probe.
//!
//! External path semantics: an absolute destination URL is fetched
//! as-is plus the original request's query string (the campaign's
//! incoming path is not appended); a relative base gets the request
//! path appended.

use crate::bundle::DomEdit;
use crate::errors::{DispatchError, Result};
use crate::macros::MacroTable;
use crate::modifications;
use crate::pages;
use crate::rewrite::{self, LinkTarget};
use bytes::Bytes;
use http::StatusCode;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, TRANSFER_ENCODING};
use hyper::Response;
use shared::http::{SvcBody, full_body, strip_proxied_headers};
use std::time::Duration;
use url::Url;

pub struct UpstreamClient {
    client: reqwest::Client,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL after redirects; relative URLs resolve against this.
    pub final_url: Url,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        UpstreamClient { client }
    }

    pub async fn fetch(&self, url: &Url) -> Result<UpstreamResponse> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify(e, url))?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify(e, url))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            final_url,
        })
    }
}

fn classify(e: reqwest::Error, url: &Url) -> DispatchError {
    if e.is_timeout() {
        DispatchError::UpstreamTimeout(url.to_string())
    } else {
        DispatchError::Upstream(e)
    }
}

/// Builds the upstream URL for a proxy destination.
pub fn proxy_base_url(dest: &str, req_path: &str, raw_query: Option<&str>) -> Result<Url> {
    let mut url = if dest.starts_with("http://") || dest.starts_with("https://") {
        Url::parse(dest)?
    } else {
        let base = Url::parse(&format!("https://{}", dest.trim_start_matches('/')))?;
        let mut joined = base.clone();
        let path = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            req_path.trim_start_matches('/')
        );
        joined.set_path(&path);
        joined
    };

    if let Some(raw_query) = raw_query.filter(|q| !q.is_empty()) {
        let merged = match url.query().filter(|q| !q.is_empty()) {
            Some(existing) => format!("{existing}&{raw_query}"),
            None => raw_query.to_string(),
        };
        url.set_query(Some(&merged));
    }
    Ok(url)
}

pub struct ProxyOutcome {
    pub response: Response<SvcBody>,
    /// Upstream answered 2xx; impressions are gated on this.
    pub success: bool,
    pub final_url: String,
}

/// Fetches and serves one upstream page. `edits` carries the DOM edit
/// list for modifications mode; `inject` is the device probe (absent
/// for bot traffic).
pub async fn serve_proxied(
    client: &UpstreamClient,
    base: Url,
    macros: &MacroTable,
    inject: Option<&str>,
    edits: Option<&[DomEdit]>,
) -> Result<ProxyOutcome> {
    let upstream = client.fetch(&base).await?;
    let success = upstream.status.is_success();

    let content_type = upstream
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = if success {
        transform_body(
            &content_type,
            &upstream.body,
            &upstream.final_url,
            macros,
            inject,
            edits,
        )
    } else {
        upstream.body.clone()
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in upstream.headers.iter() {
        // The body was decoded and rewritten; framing headers no longer
        // describe it.
        if name == CONTENT_ENCODING || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    strip_proxied_headers(headers);
    if pages::is_html_content_type(&content_type) {
        shared::http::apply_accept_ch(headers);
    }

    Ok(ProxyOutcome {
        response,
        success,
        final_url: upstream.final_url.to_string(),
    })
}

/// The text-content pipeline: URL absolutization, DOM edits, macro
/// expansion, probe injection. Non-text bodies stream through.
pub fn transform_body(
    content_type: &str,
    body: &Bytes,
    final_url: &Url,
    macros: &MacroTable,
    inject: Option<&str>,
    edits: Option<&[DomEdit]>,
) -> Bytes {
    if pages::is_html_content_type(content_type) {
        let Ok(html) = std::str::from_utf8(body) else {
            return body.clone();
        };
        let target = LinkTarget::Absolutize { base: final_url };
        let mut rewritten = rewrite::rewrite_html(html, &target, inject);
        if let Some(edits) = edits {
            rewritten = modifications::apply_edits(&rewritten, edits);
        }
        return Bytes::from(macros.expand_text(&rewritten));
    }

    if pages::is_css_content_type(content_type) {
        let Ok(css) = std::str::from_utf8(body) else {
            return body.clone();
        };
        let target = LinkTarget::Absolutize { base: final_url };
        return Bytes::from(macros.expand_text(&rewrite::rewrite_css(css, &target)));
    }

    body.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MacroTable {
        MacroTable::from_pairs(&[("campaign.id", "abc")])
    }

    #[test]
    fn absolute_destinations_keep_their_path_and_gain_the_query() {
        let url = proxy_base_url(
            "https://up.example/lp?v=2",
            "/products/item",
            Some("gclid=G"),
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://up.example/lp?v=2&gclid=G");
    }

    #[test]
    fn relative_bases_get_the_request_path() {
        let url = proxy_base_url("up.example/base", "/products/item", None).unwrap();
        assert_eq!(url.as_str(), "https://up.example/base/products/item");
    }

    #[test]
    fn empty_query_is_not_appended() {
        let url = proxy_base_url("https://up.example/lp", "/x", Some("")).unwrap();
        assert_eq!(url.as_str(), "https://up.example/lp");
    }

    #[test]
    fn html_bodies_are_rewritten_expanded_and_injected() {
        let base = Url::parse("https://up.example/lp").unwrap();
        let body = Bytes::from(
            r#"<html><body><a href="/x">{{campaign.id}}</a></body></html>"#,
        );
        let out = transform_body(
            "text/html; charset=utf-8",
            &body,
            &base,
            &table(),
            Some("<script>p()</script>"),
            None,
        );
        let out = std::str::from_utf8(&out).unwrap();
        assert!(out.contains(r#"href="https://up.example/x""#));
        assert!(out.contains(">abc</a>"));
        assert!(out.contains("<script>p()</script></body>"));
    }

    #[test]
    fn css_bodies_get_url_rewrites_and_macros() {
        let base = Url::parse("https://up.example/css/m.css").unwrap();
        let body = Bytes::from("h1{background:url(../i.png);content:\"{{campaign.id}}\"}");
        let out = transform_body("text/css", &body, &base, &table(), None, None);
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            "h1{background:url(https://up.example/i.png);content:\"abc\"}"
        );
    }

    #[test]
    fn binary_bodies_pass_through_untouched() {
        let base = Url::parse("https://up.example/a.png").unwrap();
        let body = Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47]);
        let out = transform_body("image/png", &body, &base, &table(), None, None);
        assert_eq!(out, body);
    }
}
