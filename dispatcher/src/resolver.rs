//! Rule bundle resolution: longest-matching-prefix lookup in the KV.
//!
//! The key form is `{host}{path}`. The walk tries the exact key, then
//! the trailing-slash variant, then strips one path segment and
//! repeats until the root; only a request for exactly `/` falls back to
//! the bare host key. The ordering is observable behavior: a rule at
//! `host/products/item` wins over one at `host/products` for a request
//! to `/products/item/sub`.

use crate::bundle::{FolderMode, RuleBundle};
use crate::errors::Result;
use crate::metrics_defs::{RULE_LOOKUP_HIT, RULE_LOOKUP_MISS};
use crate::selector;
use rand::Rng;
use stores::dest_cache::DestinationCache;
use stores::kv::KvStore;

pub fn lookup_keys(host: &str, path: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut push = |keys: &mut Vec<String>, key: String| {
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    let mut current = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    loop {
        push(&mut keys, format!("{host}{current}"));
        if current != "/" {
            match current.strip_suffix('/') {
                Some(stripped) => push(&mut keys, format!("{host}{stripped}")),
                None => push(&mut keys, format!("{host}{current}/")),
            }
        }
        if current == "/" {
            break;
        }
        current = parent(&current);
    }

    if path == "/" {
        push(&mut keys, host.to_string());
    }
    keys
}

fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

#[derive(Debug)]
pub struct ResolvedBundle {
    /// The KV key that produced the bundle.
    pub key: String,
    pub bundle: RuleBundle,
}

impl ResolvedBundle {
    /// Path component of the matched key, used by the redirect action's
    /// exact-path requirement.
    pub fn key_path<'a>(&'a self, host: &str) -> &'a str {
        self.key.strip_prefix(host).unwrap_or("/")
    }
}

pub async fn resolve_bundle(
    kv: &dyn KvStore,
    host: &str,
    path: &str,
) -> Result<Option<ResolvedBundle>> {
    for key in lookup_keys(host, path) {
        let Some(value) = kv.get(&key).await? else {
            continue;
        };
        match RuleBundle::decode(&value) {
            Ok(bundle) => {
                metrics::counter!(RULE_LOOKUP_HIT.name).increment(1);
                return Ok(Some(ResolvedBundle { key, bundle }));
            }
            Err(e) => {
                // A malformed bundle must not take the host down; keep
                // walking as if the key were absent.
                tracing::warn!(key, error = %e, "undecodable rule bundle");
            }
        }
    }
    metrics::counter!(RULE_LOOKUP_MISS.name).increment(1);
    Ok(None)
}

/// The bundle's default landing, after the weighted arrays are
/// collapsed to a single target + mode.
#[derive(Clone, Debug, PartialEq)]
pub struct DefaultLanding {
    pub target: String,
    pub mode: FolderMode,
    /// Set when the landing came from a destination id.
    pub destination_id: Option<String>,
}

/// An absolute URL with no explicit mode proxies; a folder hosts.
fn infer_mode(target: &str) -> FolderMode {
    if target.starts_with("http://") || target.starts_with("https://") {
        FolderMode::Proxy
    } else {
        FolderMode::Hosted
    }
}

/// Collapses `defaultDestinations` / `defaultOffers` (weighted) or the
/// plain `defaultFolder` into one landing.
pub async fn collapse_default<R: Rng + ?Sized>(
    bundle: &RuleBundle,
    dest_cache: &DestinationCache,
    rng: &mut R,
) -> Option<DefaultLanding> {
    if !bundle.default_destinations.is_empty() {
        let picked = selector::pick(
            &bundle.default_destinations,
            |d| u64::from(d.weight.unwrap_or(1)),
            rng,
        )?;
        let mode = picked
            .mode
            .or(bundle.default_folder_mode)
            .unwrap_or_else(|| infer_mode(&picked.folder));
        return Some(DefaultLanding {
            target: picked.folder.clone(),
            mode,
            destination_id: None,
        });
    }

    if !bundle.default_offers.is_empty() {
        let picked = selector::pick(
            &bundle.default_offers,
            |o| u64::from(o.weight.unwrap_or(1)),
            rng,
        )?;
        let url = dest_cache.resolve(&picked.id).await?;
        return Some(DefaultLanding {
            target: url,
            mode: FolderMode::Redirect,
            destination_id: Some(picked.id.clone()),
        });
    }

    let folder = bundle.default_folder.clone()?;
    let mode = bundle
        .default_folder_mode
        .unwrap_or_else(|| infer_mode(&folder));
    Some(DefaultLanding {
        target: folder,
        mode,
        destination_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use stores::control::{ControlStore, DestinationRecord, MemoryControl};
    use stores::kv::MemoryKv;

    #[test]
    fn walk_order_is_longest_prefix_first() {
        let keys = lookup_keys("shop.example", "/products/item/sub");
        assert_eq!(
            keys,
            vec![
                "shop.example/products/item/sub",
                "shop.example/products/item/sub/",
                "shop.example/products/item",
                "shop.example/products/item/",
                "shop.example/products",
                "shop.example/products/",
                "shop.example/",
            ]
        );
    }

    #[test]
    fn trailing_slash_paths_try_the_bare_variant_first() {
        let keys = lookup_keys("shop.example", "/products/");
        assert_eq!(
            keys,
            vec![
                "shop.example/products/",
                "shop.example/products",
                "shop.example/",
            ]
        );
    }

    #[test]
    fn bare_host_only_for_the_root_path() {
        assert_eq!(
            lookup_keys("shop.example", "/"),
            vec!["shop.example/", "shop.example"]
        );
        assert!(!lookup_keys("shop.example", "/products/item").contains(&"shop.example".to_string()));
    }

    #[tokio::test]
    async fn deeper_rules_shadow_shallower_ones() {
        let kv = MemoryKv::new();
        kv.put("shop.example/", json!({"id": "root"})).await.unwrap();
        kv.put("shop.example/a/b", json!({"id": "deep"}))
            .await
            .unwrap();

        let resolved = resolve_bundle(&kv, "shop.example", "/a/b/c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.bundle.id, "deep");
        assert_eq!(resolved.key_path("shop.example"), "/a/b");
    }

    #[tokio::test]
    async fn root_with_and_without_slash_resolve_the_same_bundle() {
        let kv = MemoryKv::new();
        kv.put("shop.example", json!({"id": "root"})).await.unwrap();

        let resolved = resolve_bundle(&kv, "shop.example", "/").await.unwrap();
        assert_eq!(resolved.unwrap().bundle.id, "root");
    }

    #[tokio::test]
    async fn malformed_bundles_fall_through_to_shorter_keys() {
        let kv = MemoryKv::new();
        kv.put("shop.example/a", json!({"id": ["not", "a", "string"]}))
            .await
            .unwrap();
        kv.put("shop.example/", json!({"id": "root"})).await.unwrap();

        let resolved = resolve_bundle(&kv, "shop.example", "/a/b").await.unwrap();
        assert_eq!(resolved.unwrap().bundle.id, "root");
    }

    fn dest_cache(control: Arc<MemoryControl>) -> DestinationCache {
        DestinationCache::new(control as Arc<dyn ControlStore>, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn default_arrays_collapse_by_weight() {
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "defaultDestinations": [
                {"folder": "a/", "weight": 1},
                {"folder": "https://up.example/", "weight": 0}
            ]
        }))
        .unwrap();

        let cache = dest_cache(Arc::new(MemoryControl::new()));
        let mut rng = StdRng::seed_from_u64(3);
        let landing = collapse_default(&bundle, &cache, &mut rng).await.unwrap();
        assert_eq!(landing.target, "a/");
        assert_eq!(landing.mode, FolderMode::Hosted);
    }

    #[tokio::test]
    async fn default_offers_resolve_through_the_destination_cache() {
        let control = Arc::new(MemoryControl::new());
        control.insert_destination(DestinationRecord {
            id: "d9".into(),
            user_id: "u1".into(),
            url: "https://off.example/".into(),
            status: "active".into(),
            updated_at: chrono::Utc::now(),
        });
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "defaultOffers": [{"id": "d9"}]
        }))
        .unwrap();

        let cache = dest_cache(control);
        let mut rng = StdRng::seed_from_u64(3);
        let landing = collapse_default(&bundle, &cache, &mut rng).await.unwrap();
        assert_eq!(landing.target, "https://off.example/");
        assert_eq!(landing.mode, FolderMode::Redirect);
        assert_eq!(landing.destination_id.as_deref(), Some("d9"));
    }

    #[tokio::test]
    async fn absolute_default_folder_without_mode_proxies() {
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "defaultFolder": "https://up.example/lp"
        }))
        .unwrap();

        let cache = dest_cache(Arc::new(MemoryControl::new()));
        let mut rng = StdRng::seed_from_u64(3);
        let landing = collapse_default(&bundle, &cache, &mut rng).await.unwrap();
        assert_eq!(landing.mode, FolderMode::Proxy);
    }
}
