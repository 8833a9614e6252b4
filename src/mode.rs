//! Analytics modes: which trace schema a query targets.

use crate::config::SearchConfig;
use crate::error::{Result, ServicemapError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trace-data schema variant selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsMode {
    /// OpenTelemetry spans ingested by Data Prepper into the default indices
    #[default]
    DataPrepper,
    /// Data Prepper schema stored under user-configured indices
    CustomDataPrepper,
    /// Jaeger spans
    Jaeger,
}

/// Which family of indices a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTarget {
    Spans,
    ServiceMap,
}

/// Field names of a trace schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSchema {
    pub service: &'static str,
    pub trace_id: &'static str,
    pub start_time: &'static str,
    pub duration: &'static str,
    /// Divide the duration field by this to get milliseconds
    pub duration_to_ms: f64,
    /// Resource a service exposes, as recorded on its service-map node
    pub node_resource: &'static str,
    /// (resource, domain) of calls a service makes
    pub outbound_edge: (&'static str, &'static str),
    /// (resource, domain) of calls a service receives
    pub inbound_edge: (&'static str, &'static str),
}

const DATA_PREPPER_FIELDS: FieldSchema = FieldSchema {
    service: "serviceName",
    trace_id: "traceId",
    start_time: "startTime",
    duration: "durationInNanos",
    duration_to_ms: 1_000_000.0,
    node_resource: "target.resource",
    outbound_edge: ("destination.resource", "destination.domain"),
    inbound_edge: ("target.resource", "target.domain"),
};

const JAEGER_FIELDS: FieldSchema = FieldSchema {
    service: "process.serviceName",
    trace_id: "traceID",
    start_time: "startTimeMillis",
    duration: "duration",
    duration_to_ms: 1_000.0,
    node_resource: "operationName",
    outbound_edge: ("spanID", "traceID"),
    inbound_edge: ("references.spanID", "references.traceID"),
};

impl AnalyticsMode {
    pub fn fields(&self) -> &'static FieldSchema {
        match self {
            AnalyticsMode::DataPrepper | AnalyticsMode::CustomDataPrepper => &DATA_PREPPER_FIELDS,
            AnalyticsMode::Jaeger => &JAEGER_FIELDS,
        }
    }

    /// Whether per-minute throughput is reported for this schema
    pub fn supports_throughput_per_minute(&self) -> bool {
        !matches!(self, AnalyticsMode::Jaeger)
    }

    /// Term filter selecting error spans.
    pub fn error_filter(&self) -> serde_json::Value {
        match self {
            AnalyticsMode::Jaeger => serde_json::json!({ "term": { "tag.error": true } }),
            _ => serde_json::json!({ "term": { "status.code": 2 } }),
        }
    }

    /// Term filter selecting server-side (entry) spans, used for metrics.
    pub fn server_span_filter(&self) -> serde_json::Value {
        match self {
            AnalyticsMode::Jaeger => serde_json::json!({ "term": { "tag.span@kind": "server" } }),
            _ => serde_json::json!({ "term": { "kind": "SPAN_KIND_SERVER" } }),
        }
    }

    /// Index pattern to search for the given target.
    pub fn index_pattern(&self, target: IndexTarget, search: &SearchConfig) -> String {
        match (self, target) {
            (AnalyticsMode::DataPrepper, IndexTarget::Spans) => "otel-v1-apm-span-*".to_string(),
            (AnalyticsMode::DataPrepper, IndexTarget::ServiceMap) => {
                "otel-v1-apm-service-map*".to_string()
            }
            (AnalyticsMode::CustomDataPrepper, IndexTarget::Spans) => {
                search.custom_span_indices.clone()
            }
            (AnalyticsMode::CustomDataPrepper, IndexTarget::ServiceMap) => {
                search.custom_service_map_indices.clone()
            }
            (AnalyticsMode::Jaeger, _) => "jaeger-span-*".to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsMode::DataPrepper => "data_prepper",
            AnalyticsMode::CustomDataPrepper => "custom_data_prepper",
            AnalyticsMode::Jaeger => "jaeger",
        }
    }
}

impl fmt::Display for AnalyticsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalyticsMode {
    type Err = ServicemapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data_prepper" => Ok(AnalyticsMode::DataPrepper),
            "custom_data_prepper" => Ok(AnalyticsMode::CustomDataPrepper),
            "jaeger" => Ok(AnalyticsMode::Jaeger),
            other => Err(ServicemapError::InvalidInput(format!(
                "Unknown analytics mode: {}",
                other
            ))),
        }
    }
}
