//! Read-only control-plane client. The hot path only ever reads three
//! things from it: destination rows by id, the cheap `updated_at`
//! freshness probe for the destination cache, and the
//! campaign → user / campaign → platform joins.

use crate::errors::{Result, StoreError};
use crate::metrics_defs::CONTROL_READ_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DestinationRecord {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl DestinationRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub user_id: String,
    pub site_id: Option<String>,
    pub platform_id: Option<String>,
    pub kv_key: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PlatformRecord {
    pub id: String,
    pub name: String,
    /// Query parameter carrying the ad network's native click id
    /// (e.g. `fbclid`, `gclid`).
    pub click_id_param: Option<String>,
}

#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn destination(&self, id: &str) -> Result<Option<DestinationRecord>>;

    /// Freshness probe: fetches only `updated_at` for a destination.
    async fn destination_updated_at(&self, id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn campaign(&self, id: &str) -> Result<Option<CampaignRecord>>;

    /// The campaigns → platforms join.
    async fn platform_for_campaign(&self, campaign_id: &str) -> Result<Option<PlatformRecord>>;
}

/// REST-backed control-plane client.
pub struct ControlPlane {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UpdatedAtResponse {
    updated_at: DateTime<Utc>,
}

impl ControlPlane {
    pub fn new(base_url: String) -> Self {
        ControlPlane {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn read_optional<T: serde::de::DeserializeOwned>(
        &self,
        kind: &'static str,
        url: String,
    ) -> Result<Option<T>> {
        let start = Instant::now();
        let result = self.read_optional_inner(url).await;
        let status = if result.is_ok() { "success" } else { "failure" };

        metrics::histogram!(CONTROL_READ_DURATION.name, "kind" => kind, "status" => status)
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn read_optional_inner<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<Option<T>> {
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StoreError::UnexpectedStatus {
                service: "control",
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl ControlStore for ControlPlane {
    async fn destination(&self, id: &str) -> Result<Option<DestinationRecord>> {
        self.read_optional("destination", format!("{}/destinations/{}", self.base_url, id))
            .await
    }

    async fn destination_updated_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let probe: Option<UpdatedAtResponse> = self
            .read_optional(
                "destination_updated_at",
                format!("{}/destinations/{}/updated-at", self.base_url, id),
            )
            .await?;
        Ok(probe.map(|p| p.updated_at))
    }

    async fn campaign(&self, id: &str) -> Result<Option<CampaignRecord>> {
        self.read_optional("campaign", format!("{}/campaigns/{}", self.base_url, id))
            .await
    }

    async fn platform_for_campaign(&self, campaign_id: &str) -> Result<Option<PlatformRecord>> {
        self.read_optional(
            "platform",
            format!("{}/campaigns/{}/platform", self.base_url, campaign_id),
        )
        .await
    }
}

/// In-memory control plane for engine tests and local development.
#[derive(Default)]
pub struct MemoryControl {
    inner: RwLock<MemoryControlInner>,
}

#[derive(Default)]
struct MemoryControlInner {
    destinations: HashMap<String, DestinationRecord>,
    campaigns: HashMap<String, CampaignRecord>,
    platforms: HashMap<String, PlatformRecord>,
    fail_reads: bool,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_destination(&self, record: DestinationRecord) {
        self.inner
            .write()
            .destinations
            .insert(record.id.clone(), record);
    }

    pub fn insert_campaign(&self, record: CampaignRecord) {
        self.inner
            .write()
            .campaigns
            .insert(record.id.clone(), record);
    }

    /// Attach a platform to a campaign id.
    pub fn insert_platform(&self, campaign_id: &str, record: PlatformRecord) {
        self.inner
            .write()
            .platforms
            .insert(campaign_id.to_string(), record);
    }

    /// Makes every read fail, for exercising the degraded paths.
    pub fn set_failing(&self, failing: bool) {
        self.inner.write().fail_reads = failing;
    }

    fn check_failing(&self) -> Result<()> {
        if self.inner.read().fail_reads {
            return Err(StoreError::UnexpectedStatus {
                service: "control",
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlStore for MemoryControl {
    async fn destination(&self, id: &str) -> Result<Option<DestinationRecord>> {
        self.check_failing()?;
        Ok(self.inner.read().destinations.get(id).cloned())
    }

    async fn destination_updated_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        self.check_failing()?;
        Ok(self
            .inner
            .read()
            .destinations
            .get(id)
            .map(|d| d.updated_at))
    }

    async fn campaign(&self, id: &str) -> Result<Option<CampaignRecord>> {
        self.check_failing()?;
        Ok(self.inner.read().campaigns.get(id).cloned())
    }

    async fn platform_for_campaign(&self, campaign_id: &str) -> Result<Option<PlatformRecord>> {
        self.check_failing()?;
        Ok(self.inner.read().platforms.get(campaign_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub fn destination(id: &str, url: &str, status: &str) -> DestinationRecord {
        DestinationRecord {
            id: id.into(),
            user_id: "u1".into(),
            url: url.into(),
            status: status.into(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn memory_control_lookups() {
        let control = MemoryControl::new();
        control.insert_destination(destination("d1", "https://offer.example/", "active"));

        let record = control.destination("d1").await.unwrap().unwrap();
        assert!(record.is_active());
        assert_eq!(
            control.destination_updated_at("d1").await.unwrap(),
            Some(record.updated_at)
        );
        assert!(control.destination("d2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_mode_errors_every_read() {
        let control = MemoryControl::new();
        control.insert_destination(destination("d1", "https://offer.example/", "active"));
        control.set_failing(true);

        assert!(control.destination("d1").await.is_err());
        assert!(control.campaign("c1").await.is_err());
    }

    #[test]
    fn inactive_destination_is_not_active() {
        assert!(!destination("d1", "https://x/", "paused").is_active());
    }
}
