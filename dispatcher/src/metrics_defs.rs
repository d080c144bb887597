//! Metrics definitions for the dispatch engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RULE_LOOKUP_HIT: MetricDef = MetricDef {
    name: "rules.lookup.hit",
    metric_type: MetricType::Counter,
    description: "Requests that resolved a rule bundle from the KV",
};

pub const RULE_LOOKUP_MISS: MetricDef = MetricDef {
    name: "rules.lookup.miss",
    metric_type: MetricType::Counter,
    description: "Requests with no bundle at any prefix key",
};

pub const BLOCK_SERVED: MetricDef = MetricDef {
    name: "dispatch.block.served",
    metric_type: MetricType::Counter,
    description: "Requests short-circuited to the safe page by a deny list or bot verdict",
};

pub const ACTION_EXECUTED: MetricDef = MetricDef {
    name: "dispatch.action.executed",
    metric_type: MetricType::Counter,
    description: "Primary actions executed, tagged by mode",
};

pub const UPSTREAM_FETCH_DURATION: MetricDef = MetricDef {
    name: "upstream.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch an upstream page in seconds",
};

pub const EVENT_EMITTED: MetricDef = MetricDef {
    name: "events.emitted",
    metric_type: MetricType::Counter,
    description: "Event rows handed to the background writer, tagged by kind",
};

pub const EVENT_EMIT_FAILED: MetricDef = MetricDef {
    name: "events.emit.failed",
    metric_type: MetricType::Counter,
    description: "Background event writes that failed after the response was sent",
};

pub const EVENT_ORPHAN_SKIPPED: MetricDef = MetricDef {
    name: "events.orphan.skipped",
    metric_type: MetricType::Counter,
    description: "Events dropped by the orphan guard (no campaign id)",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    RULE_LOOKUP_HIT,
    RULE_LOOKUP_MISS,
    BLOCK_SERVED,
    ACTION_EXECUTED,
    UPSTREAM_FETCH_DURATION,
    EVENT_EMITTED,
    EVENT_EMIT_FAILED,
    EVENT_ORPHAN_SKIPPED,
];
