//! Hosted landing pages served from the blob store.
//!
//! Resolution tries, in order: the exact file when the folder base
//! names one, the request path with `index.html` appended, the raw
//! request path, a generic asset-directory fallback table, and finally
//! the per-user drive namespace derived from the campaign owner. HTML
//! and CSS pass through macro expansion; everything else streams as-is.

use crate::context::RequestContext;
use crate::errors::Result;
use crate::macros::MacroTable;
use crate::pages;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use hyper::Response;
use shared::http::{SvcBody, apply_accept_ch, full_body};
use std::sync::Arc;
use stores::blobs::{Blob, BlobStore};
use stores::control::ControlStore;

pub struct HostedServer {
    assets: Arc<dyn BlobStore>,
    drives: Arc<dyn BlobStore>,
    control: Arc<dyn ControlStore>,
}

/// Asset-directory fallback table: pages reference flat paths that
/// hosted folders keep in conventional subdirectories.
fn fallback_dirs(ext: Option<&str>) -> Vec<&'static str> {
    let mut dirs: Vec<&'static str> = Vec::new();
    match ext {
        Some("css") => dirs.push("styles"),
        Some("js") | Some("mjs") => dirs.push("scripts"),
        Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp") | Some("avif")
        | Some("svg") | Some("ico") => dirs.push("images"),
        _ => {}
    }
    dirs.extend(["assets", "static", "files", "_files"]);
    dirs
}

fn join(base: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}

/// Appends `index.html` to directory-like paths.
fn with_index(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "index.html".to_string();
    }
    if path.ends_with('/') {
        return format!("{}index.html", path.trim_start_matches('/'));
    }
    format!("{}/index.html", path.trim_start_matches('/'))
}

impl HostedServer {
    pub fn new(
        assets: Arc<dyn BlobStore>,
        drives: Arc<dyn BlobStore>,
        control: Arc<dyn ControlStore>,
    ) -> Self {
        HostedServer {
            assets,
            drives,
            control,
        }
    }

    /// Serves a file for the request out of the folder base. Returns
    /// None when every candidate misses (the caller serves the 404
    /// page).
    pub async fn serve(
        &self,
        folder: &str,
        ctx: &RequestContext,
        campaign_id: &str,
        macros: &MacroTable,
        inject: Option<&str>,
    ) -> Result<Option<Response<SvcBody>>> {
        for key in candidates(folder, &ctx.path) {
            if let Some(blob) = self.assets.get(&key).await? {
                return Ok(Some(render(&key, blob, macros, inject)));
            }
        }

        // Secondary namespace: the campaign owner's drive.
        if !campaign_id.is_empty()
            && let Some(campaign) = self.control.campaign(campaign_id).await?
        {
            for key in drive_candidates(&campaign.user_id, folder, &ctx.path) {
                if let Some(blob) = self.drives.get(&key).await? {
                    return Ok(Some(render(&key, blob, macros, inject)));
                }
            }
        }

        Ok(None)
    }
}

fn candidates(folder: &str, req_path: &str) -> Vec<String> {
    let base = folder.trim_start_matches('/');

    // A base naming a specific file serves exactly that file.
    if pages::extension(base)
        .is_some_and(|ext| ext == "html" || ext == "htm" || pages::ASSET_EXTS.contains(&ext.as_str()))
    {
        return vec![base.trim_end_matches('/').to_string()];
    }

    let mut keys = Vec::new();
    let ext = pages::extension(req_path);
    let page_like = ext
        .as_deref()
        .is_none_or(|e| !pages::ASSET_EXTS.contains(&e) && e != "html" && e != "htm");

    if page_like {
        keys.push(join(base, &with_index(req_path)));
    }
    keys.push(join(base, req_path));

    if let Some(filename) = req_path.rsplit('/').next().filter(|f| !f.is_empty()) {
        for dir in fallback_dirs(ext.as_deref()) {
            let key = join(base, &format!("{dir}/{filename}"));
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

fn drive_candidates(user_id: &str, folder: &str, req_path: &str) -> Vec<String> {
    let base = folder.trim_start_matches('/').trim_end_matches('/');
    let mut parts = base.splitn(2, '/');
    let drive = parts.next().unwrap_or_default();
    if drive.is_empty() {
        return Vec::new();
    }
    let rest = parts.next().unwrap_or("");

    let prefix = if rest.is_empty() {
        format!("{user_id}/DRIVE_{drive}")
    } else {
        format!("{user_id}/DRIVE_{drive}/{rest}")
    };

    let mut keys = vec![join(&prefix, &with_index(req_path))];
    let raw = join(&prefix, req_path);
    if !keys.contains(&raw) {
        keys.push(raw);
    }
    keys
}

fn render(key: &str, blob: Blob, macros: &MacroTable, inject: Option<&str>) -> Response<SvcBody> {
    let content_type = blob
        .content_type
        .unwrap_or_else(|| pages::content_type_for(key).to_string());

    let body: Bytes = if pages::is_html_content_type(&content_type) {
        match std::str::from_utf8(&blob.bytes) {
            Ok(html) => {
                let mut expanded = macros.expand_text(html);
                if let Some(snippet) = inject {
                    expanded = inject_before_body_end(&expanded, snippet);
                }
                Bytes::from(expanded)
            }
            Err(_) => blob.bytes,
        }
    } else if pages::is_css_content_type(&content_type) {
        match std::str::from_utf8(&blob.bytes) {
            Ok(css) => Bytes::from(macros.expand_text(css)),
            Err(_) => blob.bytes,
        }
    } else {
        blob.bytes
    };

    let mut response = Response::new(full_body(body));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    if pages::is_html_content_type(&content_type) {
        apply_accept_ch(response.headers_mut());
    }
    response
}

fn inject_before_body_end(html: &str, snippet: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + snippet.len());
            out.push_str(&html[..idx]);
            out.push_str(snippet);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{html}{snippet}"),
    }
}
