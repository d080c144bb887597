//! Clients for the external collaborators of the dispatch engine: the
//! rule KV store, the relational control plane, the analytics event
//! store, and the blob store — plus the two per-process caches layered
//! over the control plane (destination URLs and campaign→platform
//! attribution).
//!
//! Every interface is a trait so the engine can be driven against
//! in-memory implementations in tests; the REST-backed implementations
//! are what production wiring constructs.

pub mod blobs;
pub mod control;
pub mod dest_cache;
pub mod errors;
pub mod events;
pub mod kv;
pub mod metrics_defs;
pub mod platform_cache;

pub use errors::{Result, StoreError};
