//! Metric definitions for the proxy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups served from the cache without waiting",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that had to join or start a batch",
};

pub const BATCH_FLUSH_SIZE: MetricDef = MetricDef {
    name: "batch.flush.size",
    metric_type: MetricType::Histogram,
    description: "Number of entries per flushed upstream batch",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time per upstream request attempt in seconds",
};

pub const UPSTREAM_RETRY: MetricDef = MetricDef {
    name: "upstream.retry",
    metric_type: MetricType::Counter,
    description: "Number of failed upstream attempts that were retried",
};

pub const REVERSE_LOOKUP_FAILURE: MetricDef = MetricDef {
    name: "reverse.lookup.failure",
    metric_type: MetricType::Counter,
    description: "Number of reverse DNS lookups that failed or timed out",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    BATCH_FLUSH_SIZE,
    UPSTREAM_REQUEST_DURATION,
    UPSTREAM_RETRY,
    REVERSE_LOOKUP_FAILURE,
];
