//! Service table rows: per-service trace counts joined with graph
//! connectivity and metrics.

mod trends;

pub use trends::{parse_fixed_interval, service_trends, ServiceTrend, ServiceTrends, TrendSeries};

use crate::analytics::TraceAnalytics;
use crate::dsl::Dsl;
use crate::error::{Result, ServicemapError};
use crate::gateway::{Bucket, SearchResponse};
use crate::graph::{build_service_map, GraphSetter, ServiceGraph};
use crate::mode::AnalyticsMode;
use crate::query::services_query;
use serde::Serialize;
use uuid::Uuid;

/// One row of the services table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    pub item_id: String,
    pub name: String,
    pub average_latency: Option<f64>,
    pub error_rate: Option<f64>,
    pub throughput: Option<u64>,
    pub traces: u64,
    pub connected_services: Vec<String>,
    pub number_of_connected_services: usize,
}

impl ServiceRecord {
    fn from_bucket(bucket: &Bucket, graph: &ServiceGraph) -> Option<Self> {
        let name = bucket.key_str();
        let node = graph.get(&name)?;

        let mut connected: Vec<String> = node
            .target_services
            .iter()
            .chain(node.dest_services.iter())
            .cloned()
            .collect();
        connected.sort();
        connected.dedup();

        Some(Self {
            item_id: Uuid::new_v4().to_string(),
            average_latency: node.latency,
            error_rate: node.error_rate,
            throughput: node.throughput,
            traces: bucket.value("trace_count").map(|v| v as u64).unwrap_or(0),
            number_of_connected_services: connected.len(),
            connected_services: connected,
            name,
        })
    }
}

/// Join the services aggregation with a built graph.
///
/// Services missing from the graph are dropped.
pub fn assemble_service_list(graph: &ServiceGraph, services: &SearchResponse) -> Result<Vec<ServiceRecord>> {
    let buckets = services
        .buckets("service")
        .ok_or_else(|| ServicemapError::Parse("services response has no service aggregation".into()))?;
    Ok(buckets
        .iter()
        .filter_map(|bucket| ServiceRecord::from_bucket(bucket, graph))
        .collect())
}

/// Services table for a time range and filter set
///
/// Runs the services query, then a full graph build (handed to `map_setter`
/// when given), then joins them. Failures are reported as
/// "Failed to retrieve services" and yield an empty list.
pub async fn list_services(
    ctx: &TraceAnalytics,
    dsl: &Dsl,
    mode: AnalyticsMode,
    data_source_id: Option<&str>,
    map_setter: Option<GraphSetter<'_>>,
) -> Vec<ServiceRecord> {
    let result: Result<Vec<ServiceRecord>> = async {
        let services = ctx
            .gateway
            .search(&services_query(mode, dsl, &ctx.limits), mode, data_source_id)
            .await?;
        let graph = build_service_map(ctx, dsl, mode, data_source_id, true, map_setter).await;
        if graph.is_empty() {
            return Ok(Vec::new());
        }
        assemble_service_list(&graph, &services)
    }
    .await;

    result.unwrap_or_else(|e| {
        log::error!("Error in list_services: {}", e);
        ctx.notifier.notify_error("Failed to retrieve services", &e);
        Vec::new()
    })
}

/// Detail record for one service
///
/// The scoped services query and the graph build are independent and run
/// concurrently. `None` when the service has no data in range.
pub async fn service_view(
    ctx: &TraceAnalytics,
    service_name: &str,
    dsl: &Dsl,
    mode: AnalyticsMode,
    data_source_id: Option<&str>,
) -> Option<ServiceRecord> {
    let scoped = dsl.clone().with_service_name(service_name);
    let services_request = services_query(mode, &scoped, &ctx.limits);

    let (services, graph) = tokio::join!(
        ctx.gateway.search(&services_request, mode, data_source_id),
        build_service_map(ctx, dsl, mode, data_source_id, true, None),
    );

    let result = services.and_then(|response| {
        let bucket = response
            .buckets("service")
            .ok_or_else(|| ServicemapError::Parse("services response has no service aggregation".into()))?
            .first()
            .cloned();
        Ok(bucket.and_then(|b| ServiceRecord::from_bucket(&b, &graph)))
    });

    result.unwrap_or_else(|e| {
        log::error!("Error in service_view: {}", e);
        ctx.notifier.notify_error("Failed to retrieve service view data", &e);
        None
    })
}
