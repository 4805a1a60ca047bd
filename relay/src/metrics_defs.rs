//! Metrics definitions for the relay.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "requests",
    metric_type: MetricType::Counter,
    description: "Number of handled requests. Tagged with route, status.",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with route.",
};

pub const AUTH_REJECTED: MetricDef = MetricDef {
    name: "auth.rejected",
    metric_type: MetricType::Counter,
    description: "Requests rejected before reaching a handler. Tagged with reason.",
};

pub const STALE_EVALUATIONS: MetricDef = MetricDef {
    name: "evaluations.stale",
    metric_type: MetricType::Counter,
    description: "Evaluations answered with last known flag values",
};

pub const ENVIRONMENTS_ACTIVE: MetricDef = MetricDef {
    name: "environments.active",
    metric_type: MetricType::Gauge,
    description: "Number of registered environments",
};

pub const ENVIRONMENTS_READY: MetricDef = MetricDef {
    name: "environments.ready",
    metric_type: MetricType::Gauge,
    description: "Number of registered environments that are ready",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    REQUEST_DURATION,
    AUTH_REJECTED,
    STALE_EVALUATIONS,
    ENVIRONMENTS_ACTIVE,
    ENVIRONMENTS_READY,
];

#[cfg(test)]
mod tests {
    use super::*;
    use shared::metrics_defs::find_duplicate;

    #[test]
    fn test_metric_names_are_unique() {
        assert_eq!(find_duplicate(ALL_METRICS), None);
    }
}
