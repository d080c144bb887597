//! Forward-pass HTML and CSS URL rewriting.
//!
//! Proxied pages must keep working from a foreign origin, so every
//! URL-carrying attribute is resolved against the upstream base:
//! `href` on `a`/`link`, `src` on `iframe`/`embed`/`script` and the
//! media tags, `action` on `form`, `poster`, `srcset` candidates, and
//! `url(...)` inside inline `style` attributes and standalone CSS.
//! The proxy-session mode maps the same URLs back through
//! `/proxy-session?url=...` instead, so navigation recurses through the
//! proxy.
//!
//! The rewriter is a single forward scan with a small tag parser; only
//! tags that actually change are re-spliced. Script bodies pass through
//! untouched; style bodies get the CSS pass.

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static CSS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*(['"]?)([^'")]+)['"]?\s*\)"#).unwrap());

pub enum LinkTarget<'a> {
    /// Resolve relative URLs against the upstream base; absolute URLs
    /// pass through unchanged.
    Absolutize { base: &'a Url },
    /// Resolve, then route every http(s) URL back through
    /// `/proxy-session?url=<abs>`.
    ProxySession { base: &'a Url },
}

impl LinkTarget<'_> {
    /// Returns the rewritten URL, or None when the value is left alone.
    pub fn map(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || skip_scheme(trimmed) || trimmed.starts_with('#') {
            return None;
        }
        // Macro tokens are expanded later; do not mangle them.
        if trimmed.contains("{{") {
            return None;
        }

        match self {
            LinkTarget::Absolutize { base } => {
                if has_scheme(trimmed) || trimmed.starts_with("//") {
                    return None;
                }
                base.join(trimmed).ok().map(String::from)
            }
            LinkTarget::ProxySession { base } => {
                let absolute = if has_scheme(trimmed) {
                    Url::parse(trimmed).ok()?
                } else if let Some(rest) = trimmed.strip_prefix("//") {
                    Url::parse(&format!("{}://{}", base.scheme(), rest)).ok()?
                } else {
                    base.join(trimmed).ok()?
                };
                if !matches!(absolute.scheme(), "http" | "https") {
                    return None;
                }
                let encoded: String =
                    url::form_urlencoded::byte_serialize(absolute.as_str().as_bytes()).collect();
                Some(format!("/proxy-session?url={encoded}"))
            }
        }
    }
}

fn has_scheme(value: &str) -> bool {
    value
        .split_once(':')
        .is_some_and(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        })
}

fn skip_scheme(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    ["data:", "javascript:", "mailto:", "tel:", "blob:", "about:"]
        .iter()
        .any(|s| lower.starts_with(s))
}

/// URL-carrying attributes per tag, the srcset tags aside.
fn url_attrs(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" | "link" => &["href"],
        "iframe" | "embed" => &["src"],
        "form" => &["action"],
        "img" | "script" | "video" | "audio" | "source" => &["src", "poster"],
        _ => &[],
    }
}

fn has_srcset(tag: &str) -> bool {
    matches!(tag, "img" | "source")
}

pub fn rewrite_css(css: &str, target: &LinkTarget<'_>) -> String {
    CSS_URL
        .replace_all(css, |caps: &regex::Captures<'_>| match target.map(&caps[2]) {
            Some(mapped) => format!("url({}{}{})", &caps[1], mapped, &caps[1]),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn rewrite_srcset(srcset: &str, target: &LinkTarget<'_>) -> String {
    srcset
        .split(',')
        .map(|candidate| {
            let candidate = candidate.trim();
            let mut parts = candidate.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or("");
            let descriptor = parts.next();
            let mapped = target.map(url).unwrap_or_else(|| url.to_string());
            match descriptor {
                Some(d) => format!("{mapped} {d}"),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) struct AttrSpan {
    pub(crate) name: String,
    pub(crate) value: String,
    /// Absolute byte offsets of the value within the document.
    pub(crate) value_start: usize,
    pub(crate) value_end: usize,
}

pub(crate) struct TagSpan {
    pub(crate) name: String,
    pub(crate) closing: bool,
    /// Index one past the final `>`.
    pub(crate) end: usize,
    pub(crate) attrs: Vec<AttrSpan>,
}

impl TagSpan {
    pub(crate) fn attr(&self, name: &str) -> Option<&AttrSpan> {
        self.attrs.iter().find(|a| a.name == name)
    }
}

/// Parses a tag starting at `start` (which must point at `<`). Returns
/// None for text that only looks like a tag; the caller copies it raw.
pub(crate) fn parse_tag(html: &str, start: usize) -> Option<TagSpan> {
    let bytes = html.as_bytes();
    let len = bytes.len();
    let mut i = start + 1;
    if i >= len {
        return None;
    }

    let closing = bytes[i] == b'/';
    if closing {
        i += 1;
    }

    let name_start = i;
    while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    if i == name_start {
        return None;
    }
    let name = html[name_start..i].to_ascii_lowercase();

    let mut attrs = Vec::new();
    loop {
        while i < len && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        if i >= len {
            return None;
        }
        if bytes[i] == b'>' {
            return Some(TagSpan {
                name,
                closing,
                end: i + 1,
                attrs,
            });
        }

        let attr_start = i;
        while i < len && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/')
        {
            i += 1;
        }
        if i == attr_start {
            // Stray byte; skip it rather than loop forever.
            i += 1;
            continue;
        }
        let attr_name = html[attr_start..i].to_ascii_lowercase();

        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < len && bytes[i] == b'=' {
            i += 1;
            while i < len && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < len && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let value_start = i;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                if i >= len {
                    return None;
                }
                attrs.push(AttrSpan {
                    name: attr_name,
                    value: html[value_start..i].to_string(),
                    value_start,
                    value_end: i,
                });
                i += 1;
            } else {
                let value_start = i;
                while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                attrs.push(AttrSpan {
                    name: attr_name,
                    value: html[value_start..i].to_string(),
                    value_start,
                    value_end: i,
                });
            }
        } else {
            attrs.push(AttrSpan {
                name: attr_name,
                value: String::new(),
                value_start: i,
                value_end: i,
            });
        }
    }
}

pub(crate) fn find_ci(haystack: &str, needle_lower: &str, from: usize) -> Option<usize> {
    let lower = haystack[from..].to_ascii_lowercase();
    lower.find(needle_lower).map(|pos| from + pos)
}

/// Rewrites URL attributes throughout the document and optionally
/// injects a snippet before `</body>` (appended when no close tag
/// exists).
pub fn rewrite_html(html: &str, target: &LinkTarget<'_>, inject: Option<&str>) -> String {
    let mut out = String::with_capacity(html.len() + inject.map_or(0, str::len) + 64);
    let bytes = html.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    let mut injected = false;

    while i < len {
        let Some(lt) = html[i..].find('<').map(|p| i + p) else {
            out.push_str(&html[i..]);
            break;
        };
        out.push_str(&html[i..lt]);
        i = lt;

        if html[lt..].starts_with("<!--") {
            let end = html[lt..].find("-->").map_or(len, |p| lt + p + 3);
            out.push_str(&html[lt..end]);
            i = end;
            continue;
        }
        if lt + 1 < len && (bytes[lt + 1] == b'!' || bytes[lt + 1] == b'?') {
            let end = html[lt..].find('>').map_or(len, |p| lt + p + 1);
            out.push_str(&html[lt..end]);
            i = end;
            continue;
        }

        let Some(tag) = parse_tag(html, lt) else {
            out.push('<');
            i = lt + 1;
            continue;
        };

        if tag.closing && tag.name == "body" && !injected {
            if let Some(snippet) = inject {
                out.push_str(snippet);
                injected = true;
            }
        }

        emit_tag(&mut out, html, lt, &tag, target);
        i = tag.end;

        // Raw-text elements: script bodies pass through, style bodies
        // get the CSS pass.
        if !tag.closing && (tag.name == "script" || tag.name == "style") {
            let close = format!("</{}", tag.name);
            let content_end = find_ci(html, &close, i).unwrap_or(len);
            if tag.name == "style" {
                out.push_str(&rewrite_css(&html[i..content_end], target));
            } else {
                out.push_str(&html[i..content_end]);
            }
            i = content_end;
        }
    }

    if !injected && let Some(snippet) = inject {
        out.push_str(snippet);
    }
    out
}

fn emit_tag(out: &mut String, html: &str, start: usize, tag: &TagSpan, target: &LinkTarget<'_>) {
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();

    if !tag.closing {
        let rewritable = url_attrs(&tag.name);
        for attr in &tag.attrs {
            if attr.value.is_empty() {
                continue;
            }
            let new_value = if rewritable.contains(&attr.name.as_str()) {
                target.map(&attr.value)
            } else if attr.name == "srcset" && has_srcset(&tag.name) {
                let rewritten = rewrite_srcset(&attr.value, target);
                (rewritten != attr.value).then_some(rewritten)
            } else if attr.name == "style" {
                let rewritten = rewrite_css(&attr.value, target);
                (rewritten != attr.value).then_some(rewritten)
            } else {
                None
            };
            if let Some(new_value) = new_value {
                replacements.push((attr.value_start, attr.value_end, new_value));
            }
        }
    }

    if replacements.is_empty() {
        out.push_str(&html[start..tag.end]);
        return;
    }

    let mut cursor = start;
    for (value_start, value_end, new_value) in replacements {
        out.push_str(&html[cursor..value_start]);
        out.push_str(&new_value);
        cursor = value_end;
    }
    out.push_str(&html[cursor..tag.end]);
}
