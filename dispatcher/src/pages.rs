//! Page-like vs asset classification and the extension → content-type
//! table used by the hosted server.
//!
//! "Page-like" gates two behaviors: query-parameter flag predicates only
//! apply on pages, and impressions are only emitted for pages. A path is
//! page-like when it is `/`, ends in `/`, ends in `.html`/`.htm`, or has
//! no extension / an extension outside the known asset set.

/// Extensions that mark a request as an asset rather than a page.
pub const ASSET_EXTS: &[&str] = &[
    "css", "js", "mjs", "json", "xml", "txt", "svg", "png", "jpg", "jpeg", "gif", "webp", "avif",
    "ico", "woff", "woff2", "ttf", "otf", "eot", "mp4", "webm", "mp3", "wav", "pdf", "zip", "wasm",
    "map",
];

/// Returns the extension of a path's final segment, lowercased.
pub fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_page_like(path: &str) -> bool {
    if path == "/" || path.ends_with('/') {
        return true;
    }
    match extension(path) {
        None => true,
        Some(ext) => ext == "html" || ext == "htm" || !ASSET_EXTS.contains(&ext.as_str()),
    }
}

pub fn is_asset(path: &str) -> bool {
    !is_page_like(path)
}

/// Extension-derived content type; stored blob metadata overrides this.
pub fn content_type_for(path: &str) -> &'static str {
    let Some(ext) = extension(path) else {
        return "application/octet-stream";
    };
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "wasm" => "application/wasm",
        "map" => "application/json",
        _ => "application/octet-stream",
    }
}

/// True when the response content type should go through macro expansion
/// and URL rewriting.
pub fn is_html_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/html")
}

pub fn is_css_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/css")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_directories_are_pages() {
        assert!(is_page_like("/"));
        assert!(is_page_like("/products/"));
        assert!(is_page_like("/products/item"));
    }

    #[test]
    fn html_is_a_page_even_with_extension() {
        assert!(is_page_like("/landing.html"));
        assert!(is_page_like("/landing.htm"));
    }

    #[test]
    fn known_assets_are_not_pages() {
        assert!(is_asset("/styles/main.css"));
        assert!(is_asset("/app.js"));
        assert!(is_asset("/img/hero.webp"));
    }

    #[test]
    fn unknown_extensions_count_as_pages() {
        // e.g. /download.exe or versioned paths like /v1.2
        assert!(is_page_like("/v1.2"));
        assert!(is_page_like("/report.aspx"));
    }

    #[test]
    fn extension_reads_only_the_final_segment() {
        assert_eq!(extension("/a.b/c"), None);
        assert_eq!(extension("/a/b/c.CSS"), Some("css".to_string()));
        assert_eq!(extension("/.hidden"), None);
    }

    #[test]
    fn content_types_cover_the_asset_table() {
        assert_eq!(content_type_for("/x/index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("/f.woff2"), "font/woff2");
        assert_eq!(content_type_for("/f.unknownext"), "application/octet-stream");
        assert_eq!(content_type_for("/noext"), "application/octet-stream");
    }
}
