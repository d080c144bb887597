use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

/// Backend selection for the rule KV.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvBackend {
    /// In-process map, for tests and local development.
    Memory,
    Rest { url: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBackend {
    Memory,
    Rest { url: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobBackend {
    Memory,
    Filesystem { path: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoresConfig {
    pub kv: KvBackend,
    pub control_url: String,
    pub events: EventBackend,
    /// Global assets namespace (hosted landing pages).
    pub assets: BlobBackend,
    /// Per-user drive namespace.
    pub drives: BlobBackend,
}

fn default_dest_fast_path_ms() -> u64 {
    100
}

fn default_platform_ttl_secs() -> u64 {
    15 * 60
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Fast-path window of the destination cache, in milliseconds.
    pub dest_cache_fast_path_ms: u64,
    /// TTL of the campaign→platform cache, in seconds.
    pub platform_cache_ttl_secs: u64,
    /// Deadline for upstream page fetches, in seconds.
    pub upstream_timeout_secs: u64,
    /// Whether an inverted `time` flag (start > end) wraps midnight.
    pub match_time_wraps_midnight: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dest_cache_fast_path_ms: default_dest_fast_path_ms(),
            platform_cache_ttl_secs: default_platform_ttl_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            match_time_wraps_midnight: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub listener: Listener,
    pub admin_listener: Option<Listener>,
    pub stores: StoresConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}
