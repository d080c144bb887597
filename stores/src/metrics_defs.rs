//! Metrics definitions for the store clients and caches.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DEST_CACHE_HIT: MetricDef = MetricDef {
    name: "dest_cache.hit",
    metric_type: MetricType::Counter,
    description: "Destination lookups served from the fast-path window",
};

pub const DEST_CACHE_PROBE: MetricDef = MetricDef {
    name: "dest_cache.probe",
    metric_type: MetricType::Counter,
    description: "Destination lookups that ran the updated_at freshness probe",
};

pub const DEST_CACHE_REFILL: MetricDef = MetricDef {
    name: "dest_cache.refill",
    metric_type: MetricType::Counter,
    description: "Destination lookups that fetched a full record from the control plane",
};

pub const PLATFORM_CACHE_HIT: MetricDef = MetricDef {
    name: "platform_cache.hit",
    metric_type: MetricType::Counter,
    description: "Campaign platform lookups served from cache",
};

pub const PLATFORM_CACHE_MISS: MetricDef = MetricDef {
    name: "platform_cache.miss",
    metric_type: MetricType::Counter,
    description: "Campaign platform lookups that went to the control plane",
};

pub const CONTROL_READ_DURATION: MetricDef = MetricDef {
    name: "control.read.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a control-plane read in seconds",
};

pub const EVENT_INSERT_FAILED: MetricDef = MetricDef {
    name: "events.insert.failed",
    metric_type: MetricType::Counter,
    description: "Event rows that could not be written to the event store",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    DEST_CACHE_HIT,
    DEST_CACHE_PROBE,
    DEST_CACHE_REFILL,
    PLATFORM_CACHE_HIT,
    PLATFORM_CACHE_MISS,
    CONTROL_READ_DURATION,
    EVENT_INSERT_FAILED,
];
