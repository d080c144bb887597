//! Per-instance destination URL cache.
//!
//! Destination edits must propagate quickly without putting the control
//! plane on the hot path. The read path is tiered: a short fast-path
//! window (default 100 ms) returns the cached URL without any I/O, so a
//! burst of lookups inside one request costs one read; past the window
//! a cheap `updated_at` probe confirms freshness; only an observed edit
//! (or a cold key) fetches the full record. Failed lookups cache a null
//! result so a broken destination id cannot storm the control plane.

use crate::control::ControlStore;
use crate::metrics_defs::{DEST_CACHE_HIT, DEST_CACHE_PROBE, DEST_CACHE_REFILL};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct DestCacheEntry {
    /// None caches a negative result (missing, inactive, or erroring).
    url: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    cached_at: Instant,
}

pub struct DestinationCache {
    control: Arc<dyn ControlStore>,
    entries: RwLock<HashMap<String, DestCacheEntry>>,
    fast_path: Duration,
}

impl DestinationCache {
    pub const DEFAULT_FAST_PATH: Duration = Duration::from_millis(100);

    pub fn new(control: Arc<dyn ControlStore>, fast_path: Duration) -> Self {
        DestinationCache {
            control,
            entries: RwLock::new(HashMap::new()),
            fast_path,
        }
    }

    /// Resolves a destination id to its active URL, or None when the
    /// destination is missing, inactive, or currently unresolvable.
    pub async fn resolve(&self, id: &str) -> Option<String> {
        let cached = self.entries.read().get(id).cloned();

        if let Some(entry) = cached {
            if entry.cached_at.elapsed() < self.fast_path {
                metrics::counter!(DEST_CACHE_HIT.name).increment(1);
                return entry.url;
            }

            metrics::counter!(DEST_CACHE_PROBE.name).increment(1);
            match self.control.destination_updated_at(id).await {
                Ok(Some(ts)) if Some(ts) == entry.updated_at => {
                    let url = entry.url.clone();
                    self.store(id, entry.url, entry.updated_at);
                    return url;
                }
                Ok(Some(_)) => {
                    // updated_at advanced; fall through to a full fetch.
                }
                Ok(None) => {
                    self.store(id, None, None);
                    return None;
                }
                Err(e) => {
                    tracing::warn!(destination = id, error = %e, "destination probe failed, serving stale");
                    let url = entry.url.clone();
                    self.store(id, entry.url, entry.updated_at);
                    return url;
                }
            }
        }

        self.refill(id).await
    }

    async fn refill(&self, id: &str) -> Option<String> {
        metrics::counter!(DEST_CACHE_REFILL.name).increment(1);
        match self.control.destination(id).await {
            Ok(Some(record)) if record.is_active() => {
                self.store(id, Some(record.url.clone()), Some(record.updated_at));
                Some(record.url)
            }
            Ok(_) => {
                self.store(id, None, None);
                None
            }
            Err(e) => {
                tracing::warn!(destination = id, error = %e, "destination fetch failed, caching null");
                self.store(id, None, None);
                None
            }
        }
    }

    // Whole-entry replace per key; concurrent readers see either the old
    // or the new entry, never a partial one.
    fn store(&self, id: &str, url: Option<String>, updated_at: Option<DateTime<Utc>>) {
        self.entries.write().insert(
            id.to_string(),
            DestCacheEntry {
                url,
                updated_at,
                cached_at: Instant::now(),
            },
        );
    }
}
