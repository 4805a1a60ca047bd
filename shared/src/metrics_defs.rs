//! Metric definitions shared by every crate that emits metrics.
//!
//! Each crate declares its metrics as `MetricDef` constants and emits them
//! through the `counter!`, `gauge!` and `histogram!` macros below, so names
//! are never spelled out at the call site.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

impl MetricDef {
    /// Registers the description with the installed recorder.
    pub fn describe(&self) {
        match self.metric_type {
            MetricType::Counter => metrics::describe_counter!(self.name, self.description),
            MetricType::Gauge => metrics::describe_gauge!(self.name, self.description),
            MetricType::Histogram => metrics::describe_histogram!(self.name, self.description),
        }
    }
}

pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        def.describe();
    }
}

/// The first name declared more than once, if any.
pub fn find_duplicate(defs: &[MetricDef]) -> Option<&'static str> {
    let mut seen = HashSet::new();
    defs.iter()
        .map(|def| def.name)
        .find(|name| !seen.insert(*name))
}

// The macros below accept optional `"label" => value` pairs which are passed
// through to the `metrics` facade unchanged.

#[macro_export]
macro_rules! counter {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        metrics::counter!($def.name $(, $key => $value)*)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        metrics::gauge!($def.name $(, $key => $value)*)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        metrics::histogram!($def.name $(, $key => $value)*)
    };
}
