//! Pure builders for the aggregation queries behind the service map and
//! service tables. No I/O; every builder returns a [`SearchRequest`].

use crate::dsl::Dsl;
use crate::mode::{AnalyticsMode, IndexTarget};
use serde_json::{json, Map, Value};

/// A query body plus the index family it runs against.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub target: IndexTarget,
    pub body: Value,
}

/// Direction of an edge query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// Calls a service makes (outbound)
    Target,
    /// Calls a service receives (inbound)
    Destination,
}

/// Bucket-size limits for terms aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_nodes: usize,
    pub max_edges: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_nodes: 500,
            max_edges: 1000,
        }
    }
}

fn bool_query(filter: Vec<Value>) -> Value {
    json!({
        "bool": {
            "must": [],
            "filter": filter,
            "should": [],
            "must_not": []
        }
    })
}

/// Service-map nodes: one bucket per service with the resources it serves.
pub fn service_nodes_query(mode: AnalyticsMode, limits: &QueryLimits) -> SearchRequest {
    let fields = mode.fields();
    SearchRequest {
        target: IndexTarget::ServiceMap,
        body: json!({
            "size": 0,
            "query": bool_query(vec![]),
            "aggs": {
                "service_name": {
                    "terms": { "field": fields.service, "size": limits.max_nodes },
                    "aggs": {
                        "target_resource": {
                            "terms": { "field": fields.node_resource, "size": limits.max_edges }
                        }
                    }
                }
            }
        }),
    }
}

/// Edges in one direction, nested service → resource → domain.
pub fn service_edges_query(
    direction: EdgeDirection,
    mode: AnalyticsMode,
    limits: &QueryLimits,
) -> SearchRequest {
    let fields = mode.fields();
    let (resource, domain) = match direction {
        EdgeDirection::Target => fields.outbound_edge,
        EdgeDirection::Destination => fields.inbound_edge,
    };
    SearchRequest {
        target: IndexTarget::ServiceMap,
        body: json!({
            "size": 0,
            "query": bool_query(vec![json!({ "exists": { "field": resource } })]),
            "aggs": {
                "service_name": {
                    "terms": { "field": fields.service, "size": limits.max_nodes },
                    "aggs": {
                        "resource": {
                            "terms": { "field": resource, "size": limits.max_edges },
                            "aggs": {
                                "domain": {
                                    "terms": { "field": domain, "size": limits.max_edges }
                                }
                            }
                        }
                    }
                }
            }
        }),
    }
}

/// Latency (ms) and error-rate (percent) sub-aggregations shared by the
/// metrics and trends queries.
fn latency_and_error_aggs(mode: AnalyticsMode) -> Map<String, Value> {
    let fields = mode.fields();
    let mut aggs = Map::new();
    aggs.insert(
        "average_latency_raw".to_string(),
        json!({ "avg": { "field": fields.duration } }),
    );
    aggs.insert(
        "average_latency".to_string(),
        json!({
            "bucket_script": {
                "buckets_path": { "avg": "average_latency_raw" },
                "script": format!("params.avg / {}", fields.duration_to_ms)
            }
        }),
    );
    aggs.insert(
        "error_count".to_string(),
        json!({ "filter": mode.error_filter() }),
    );
    aggs.insert(
        "error_rate".to_string(),
        json!({
            "bucket_script": {
                "buckets_path": { "errors": "error_count._count", "total": "_count" },
                "script": "params.errors / params.total * 100"
            }
        }),
    );
    aggs
}

/// Per-service latency, error rate and request count for the given services.
pub fn service_metrics_query(dsl: &Dsl, service_names: &[String], mode: AnalyticsMode) -> SearchRequest {
    let fields = mode.fields();
    let mut filter = vec![
        json!({ "terms": { fields.service: service_names } }),
        mode.server_span_filter(),
    ];
    filter.extend(dsl.filter_clauses(mode));

    SearchRequest {
        target: IndexTarget::Spans,
        body: json!({
            "size": 0,
            "query": bool_query(filter),
            "aggs": {
                "service_name": {
                    "terms": { "field": fields.service, "size": service_names.len().max(1) },
                    "aggs": latency_and_error_aggs(mode)
                }
            }
        }),
    }
}

/// Trace counts per service, honouring the DSL's optional service filter.
pub fn services_query(mode: AnalyticsMode, dsl: &Dsl, limits: &QueryLimits) -> SearchRequest {
    let fields = mode.fields();
    SearchRequest {
        target: IndexTarget::Spans,
        body: json!({
            "size": 0,
            "query": bool_query(dsl.filter_clauses(mode)),
            "aggs": {
                "service": {
                    "terms": { "field": fields.service, "size": limits.max_nodes },
                    "aggs": {
                        "trace_count": { "cardinality": { "field": fields.trace_id } }
                    }
                }
            }
        }),
    }
}

/// Per-service time series of latency, trace count and error rate.
pub fn service_trends_query(
    mode: AnalyticsMode,
    dsl: &Dsl,
    fixed_interval: &str,
    limits: &QueryLimits,
) -> SearchRequest {
    let fields = mode.fields();
    let mut bucket_aggs = latency_and_error_aggs(mode);
    bucket_aggs.insert(
        "trace_count".to_string(),
        json!({ "cardinality": { "field": fields.trace_id } }),
    );

    SearchRequest {
        target: IndexTarget::Spans,
        body: json!({
            "size": 0,
            "query": bool_query(dsl.filter_clauses(mode)),
            "aggs": {
                "service_trends": {
                    "terms": { "field": fields.service, "size": limits.max_nodes },
                    "aggs": {
                        "time_buckets": {
                            "date_histogram": {
                                "field": fields.start_time,
                                "fixed_interval": fixed_interval,
                                "min_doc_count": 0
                            },
                            "aggs": bucket_aggs
                        }
                    }
                }
            }
        }),
    }
}
