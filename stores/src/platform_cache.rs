// Read-through cache of campaign → ad-platform attribution. Platform
// rows change rarely; a TTL in the minutes is plenty and keeps the
// campaigns/platforms join off the hot path.

use crate::control::{ControlStore, PlatformRecord};
use crate::metrics_defs::{PLATFORM_CACHE_HIT, PLATFORM_CACHE_MISS};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

const SIZE: u64 = 10_000;

#[derive(Clone, Debug, PartialEq)]
pub struct PlatformAttribution {
    pub platform_id: String,
    pub platform_name: String,
    pub click_id_param: Option<String>,
}

impl From<PlatformRecord> for PlatformAttribution {
    fn from(record: PlatformRecord) -> Self {
        PlatformAttribution {
            platform_id: record.id,
            platform_name: record.name,
            click_id_param: record.click_id_param,
        }
    }
}

pub struct PlatformCache {
    control: Arc<dyn ControlStore>,
    cache: Cache<String, Option<Arc<PlatformAttribution>>>,
}

impl PlatformCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

    pub fn new(control: Arc<dyn ControlStore>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(ttl)
            .build();

        PlatformCache { control, cache }
    }

    /// Returns the platform attribution for a campaign, or None when
    /// the campaign has no platform (also cached, for the TTL).
    pub async fn get(&self, campaign_id: &str) -> Option<Arc<PlatformAttribution>> {
        if let Some(cached) = self.cache.get(campaign_id) {
            metrics::counter!(PLATFORM_CACHE_HIT.name).increment(1);
            return cached;
        }

        metrics::counter!(PLATFORM_CACHE_MISS.name).increment(1);
        let attribution = match self.control.platform_for_campaign(campaign_id).await {
            Ok(record) => record.map(|r| Arc::new(PlatformAttribution::from(r))),
            Err(e) => {
                tracing::warn!(campaign = campaign_id, error = %e, "platform lookup failed");
                None
            }
        };

        self.cache
            .insert(campaign_id.to_string(), attribution.clone());
        attribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryControl;

    #[tokio::test]
    async fn caches_platform_rows_for_the_ttl() {
        let control = Arc::new(MemoryControl::new());
        control.insert_platform(
            "camp1",
            PlatformRecord {
                id: "p1".into(),
                name: "facebook".into(),
                click_id_param: Some("fbclid".into()),
            },
        );

        let cache = PlatformCache::new(
            control.clone() as Arc<dyn ControlStore>,
            Duration::from_secs(60),
        );

        let first = cache.get("camp1").await.unwrap();
        assert_eq!(first.click_id_param.as_deref(), Some("fbclid"));

        // Control goes away; the cached row still answers.
        control.set_failing(true);
        let second = cache.get("camp1").await.unwrap();
        assert_eq!(second.platform_name, "facebook");
    }

    #[tokio::test]
    async fn campaigns_without_platforms_cache_none() {
        let control = Arc::new(MemoryControl::new());
        let cache = PlatformCache::new(
            control.clone() as Arc<dyn ControlStore>,
            Duration::from_secs(60),
        );

        assert!(cache.get("camp1").await.is_none());

        // A lookup failure also lands as None rather than an error.
        control.set_failing(true);
        assert!(cache.get("camp2").await.is_none());
    }
}
