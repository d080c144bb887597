//! The rule KV store: string key to JSON value, keyed by `{host}{path}`.

use crate::errors::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use std::collections::HashMap;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// A missing key is not an error; it means "no rule".
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// In-memory KV used by tests and local development.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// REST-backed KV client. Keys are percent-encoded into the path.
pub struct RestKv {
    client: reqwest::Client,
    base_url: String,
}

impl RestKv {
    pub fn new(base_url: String) -> Self {
        RestKv {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        let encoded: String = percent_encode_key(key);
        format!("{}/values/{}", self.base_url, encoded)
    }
}

fn percent_encode_key(key: &str) -> String {
    // Only '/' and '%' collide with path syntax in our key alphabet.
    key.replace('%', "%25").replace('/', "%2F")
}

#[async_trait]
impl KvStore for RestKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let response = self.client.get(self.key_url(key)).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StoreError::UnexpectedStatus {
                service: "kv",
                status: status.as_u16(),
            }),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .put(self.key_url(key))
            .json(&value)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(StoreError::UnexpectedStatus {
                service: "kv",
                status: status.as_u16(),
            }),
        }
    }
}
