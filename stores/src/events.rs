//! The unified analytics event row and the event-store contract.
//!
//! One table holds impressions, clicks, and conversions; the flags on
//! the row say which it is, and a redirect-mode dispatch sets both
//! impression and click on a single row. Insertion is idempotent on
//! `event_id` — the store applies ON CONFLICT DO NOTHING semantics, so
//! replays and retries are observational no-ops.

use crate::errors::{Result, StoreError};
use crate::metrics_defs::EVENT_INSERT_FAILED;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub event_id: String,
    pub session_id: String,
    pub campaign_id: String,
    pub campaign_name: Option<String>,
    pub site_name: Option<String>,

    pub is_impression: bool,
    pub is_click: bool,
    pub is_conversion: bool,

    // Request context
    pub host: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub referrer: Option<String>,
    pub is_embed: bool,
    pub ip: Option<String>,
    pub org: Option<String>,

    // User agent
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub device: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub arch: Option<String>,

    // Geo
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: Option<String>,
    pub postal_code: Option<String>,

    // Edge transport
    pub asn: Option<u32>,
    pub colo: Option<String>,
    pub bot_score: Option<i64>,
    pub trust_score: Option<i64>,
    pub verified_bot: bool,
    pub http_protocol: Option<String>,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,

    // Dispatch outcome
    pub landing_page: Option<String>,
    pub landing_page_mode: Option<String>,
    pub destination_url: Option<String>,
    pub destination_id: Option<String>,
    pub matched_flags: Option<Vec<String>>,

    // Attribution
    pub platform_id: Option<String>,
    pub platform_name: Option<String>,
    pub platform_click_id: Option<String>,
    pub impression_id: Option<String>,
    pub click_id: Option<String>,

    // Conversion
    pub payout: Option<f64>,
    pub conversion_type: Option<String>,
    pub postback_data: Option<HashMap<String, String>>,

    pub created_at: Option<DateTime<Utc>>,
}

/// Late-arriving device signals reported by the in-page probe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enrichment {
    pub screen: Option<String>,
    pub dpr: Option<f64>,
    pub gpu: Option<String>,
    pub tz: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub arch: Option<String>,
}

/// What the click-out handler needs back from a prior impression.
#[derive(Clone, Debug, PartialEq)]
pub struct ImpressionRef {
    pub landing_page: Option<String>,
    pub landing_page_mode: Option<String>,
    pub query: HashMap<String, String>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent on `event_id`: a second insert with the same id is a
    /// no-op, never an error.
    async fn insert(&self, event: &Event) -> Result<()>;

    /// Best-effort update of the enrichment columns only.
    async fn update_enrichment(&self, event_id: &str, enrichment: &Enrichment) -> Result<()>;

    /// Looks up a click row by its event id (postback linkage).
    async fn find_click(&self, event_id: &str) -> Result<Option<Event>>;

    /// Recovers the landing page and original query of an impression.
    async fn find_impression(&self, impression_id: &str) -> Result<Option<ImpressionRef>>;
}

/// In-memory event store. First write wins per event id, mirroring the
/// production store's conflict clause.
#[derive(Default)]
pub struct MemoryEventStore {
    rows: RwLock<HashMap<String, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Event> {
        self.rows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<Event> {
        self.rows.read().get(event_id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &Event) -> Result<()> {
        self.rows
            .write()
            .entry(event.event_id.clone())
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn update_enrichment(&self, event_id: &str, enrichment: &Enrichment) -> Result<()> {
        if let Some(row) = self.rows.write().get_mut(event_id) {
            if enrichment.model.is_some() {
                row.model = enrichment.model.clone();
            }
            if enrichment.os_version.is_some() {
                row.os_version = enrichment.os_version.clone();
            }
            if enrichment.arch.is_some() {
                row.arch = enrichment.arch.clone();
            }
        }
        Ok(())
    }

    async fn find_click(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(self
            .rows
            .read()
            .get(event_id)
            .filter(|row| row.is_click)
            .cloned())
    }

    async fn find_impression(&self, impression_id: &str) -> Result<Option<ImpressionRef>> {
        Ok(self
            .rows
            .read()
            .get(impression_id)
            .filter(|row| row.is_impression)
            .map(|row| ImpressionRef {
                landing_page: row.landing_page.clone(),
                landing_page_mode: row.landing_page_mode.clone(),
                query: row.query.clone(),
            }))
    }
}

/// REST-backed event store client.
pub struct RestEventStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestEventStore {
    pub fn new(base_url: String) -> Self {
        RestEventStore {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EventStore for RestEventStore {
    async fn insert(&self, event: &Event) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/events", self.base_url))
            .json(event)
            .send()
            .await?;

        match response.status() {
            // 409 means the conflict clause dropped the row; that is the
            // idempotency contract working, not a failure.
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            status => {
                metrics::counter!(EVENT_INSERT_FAILED.name).increment(1);
                Err(StoreError::UnexpectedStatus {
                    service: "events",
                    status: status.as_u16(),
                })
            }
        }
    }

    async fn update_enrichment(&self, event_id: &str, enrichment: &Enrichment) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/events/{}/enrichment", self.base_url, event_id))
            .json(enrichment)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(StoreError::UnexpectedStatus {
                service: "events",
                status: status.as_u16(),
            }),
        }
    }

    async fn find_click(&self, event_id: &str) -> Result<Option<Event>> {
        let response = self
            .client
            .get(format!("{}/events/{}", self.base_url, event_id))
            .query(&[("kind", "click")])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StoreError::UnexpectedStatus {
                service: "events",
                status: status.as_u16(),
            }),
        }
    }

    async fn find_impression(&self, impression_id: &str) -> Result<Option<ImpressionRef>> {
        let response = self
            .client
            .get(format!("{}/events/{}", self.base_url, impression_id))
            .query(&[("kind", "impression")])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let row: Event = response.json().await?;
                Ok(Some(ImpressionRef {
                    landing_page: row.landing_page,
                    landing_page_mode: row.landing_page_mode,
                    query: row.query,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StoreError::UnexpectedStatus {
                service: "events",
                status: status.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click_row(event_id: &str) -> Event {
        Event {
            event_id: event_id.into(),
            session_id: "s1".into(),
            campaign_id: "c1".into(),
            is_click: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_event_id() {
        let store = MemoryEventStore::new();
        let first = click_row("ev1");
        let mut replay = click_row("ev1");
        replay.campaign_id = "other".into();

        store.insert(&first).await.unwrap();
        store.insert(&replay).await.unwrap();

        assert_eq!(store.len(), 1);
        // the replay did not overwrite
        assert_eq!(store.get("ev1").unwrap().campaign_id, "c1");
    }

    #[tokio::test]
    async fn find_click_ignores_non_click_rows() {
        let store = MemoryEventStore::new();
        let mut impression = click_row("ev1");
        impression.is_click = false;
        impression.is_impression = true;
        store.insert(&impression).await.unwrap();

        assert!(store.find_click("ev1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn impression_lookback_returns_query() {
        let store = MemoryEventStore::new();
        let mut impression = click_row("imp1");
        impression.is_click = false;
        impression.is_impression = true;
        impression.landing_page = Some("https://up.example/lp".into());
        impression.landing_page_mode = Some("proxy".into());
        impression.query = HashMap::from([("fbclid".to_string(), "F".to_string())]);
        store.insert(&impression).await.unwrap();

        let found = store.find_impression("imp1").await.unwrap().unwrap();
        assert_eq!(found.landing_page.as_deref(), Some("https://up.example/lp"));
        assert_eq!(found.query["fbclid"], "F");
    }

    #[tokio::test]
    async fn enrichment_touches_only_device_columns() {
        let store = MemoryEventStore::new();
        let mut row = click_row("imp1");
        row.browser = Some("Chrome".into());
        store.insert(&row).await.unwrap();

        store
            .update_enrichment(
                "imp1",
                &Enrichment {
                    model: Some("Pixel 9".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store.get("imp1").unwrap();
        assert_eq!(updated.model.as_deref(), Some("Pixel 9"));
        assert_eq!(updated.browser.as_deref(), Some("Chrome"));
    }
}
