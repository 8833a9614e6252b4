use crate::analytics::TraceAnalytics;
use crate::dsl::Dsl;
use crate::error::{Result, ServicemapError};
use crate::gateway::SearchResponse;
use crate::graph::{outbound_lookup, ServiceGraph, ServiceMetrics};
use crate::mode::AnalyticsMode;
use crate::query::{service_edges_query, service_metrics_query, service_nodes_query, EdgeDirection};
use chrono::Utc;
use std::collections::HashMap;

/// Receives the finished graph once per build.
pub type GraphSetter<'a> = &'a (dyn Fn(&ServiceGraph) + Send + Sync);

/// Build the service dependency graph for one time range and filter set
///
/// Issues, in order: node discovery, outbound edges, inbound edges and,
/// when `include_metrics` is set, the metrics query. Each request is tried
/// once.
///
/// # Failure handling
///
/// * Node discovery failing is reported through the notifier and yields the
///   empty graph. Zero discovered services also yields the empty graph, and
///   no further queries are sent.
/// * Edge or metrics failures are logged and the step is skipped; the graph
///   is returned with whatever was resolved.
///
/// `setter`, when given, receives the final graph before it is returned.
pub async fn build_service_map(
    ctx: &TraceAnalytics,
    dsl: &Dsl,
    mode: AnalyticsMode,
    data_source_id: Option<&str>,
    include_metrics: bool,
    setter: Option<GraphSetter<'_>>,
) -> ServiceGraph {
    let start = std::time::Instant::now();

    let minutes_in_range = if mode.supports_throughput_per_minute() {
        dsl.minutes_in_range(Utc::now()).unwrap_or_else(|e| {
            log::warn!("Ignoring time range for throughput: {}", e);
            None
        })
    } else {
        None
    };

    let nodes = ctx
        .gateway
        .search(&service_nodes_query(mode, &ctx.limits), mode, data_source_id)
        .await;
    let mut graph = match nodes {
        Ok(response) => match response.buckets("service_name") {
            Some(buckets) => ServiceGraph::from_node_buckets(buckets),
            None => ServiceGraph::new(),
        },
        Err(e) => {
            log::error!("Error retrieving service nodes: {}", e);
            ctx.notifier.notify_error("Failed to retrieve service nodes", &e);
            ServiceGraph::new()
        }
    };

    if graph.is_empty() {
        return finish(graph, setter);
    }

    let lookup = match fetch_edges(ctx, EdgeDirection::Target, mode, data_source_id)
        .await
        .and_then(|response| outbound_lookup(&response))
    {
        Ok(lookup) => lookup,
        Err(e) => {
            log::error!("Error retrieving target edges: {}", e);
            HashMap::new()
        }
    };

    match fetch_edges(ctx, EdgeDirection::Destination, mode, data_source_id)
        .await
        .and_then(|response| graph.resolve_edges(&response, &lookup))
    {
        Ok(matched) => log::debug!("Resolved {} service edges", matched),
        Err(e) => log::error!("Error retrieving destination edges: {}", e),
    }

    if include_metrics {
        if let Err(e) = annotate_metrics(ctx, &mut graph, dsl, mode, data_source_id, minutes_in_range).await {
            log::error!("Error retrieving service metrics: {}", e);
        }
    }

    log::debug!(
        "Built service map with {} services ({}) in {:?}",
        graph.len(),
        mode,
        start.elapsed()
    );
    finish(graph, setter)
}

fn finish(graph: ServiceGraph, setter: Option<GraphSetter<'_>>) -> ServiceGraph {
    if let Some(set) = setter {
        set(&graph);
    }
    graph
}

async fn fetch_edges(
    ctx: &TraceAnalytics,
    direction: EdgeDirection,
    mode: AnalyticsMode,
    data_source_id: Option<&str>,
) -> Result<SearchResponse> {
    ctx.gateway
        .search(&service_edges_query(direction, mode, &ctx.limits), mode, data_source_id)
        .await
}

async fn annotate_metrics(
    ctx: &TraceAnalytics,
    graph: &mut ServiceGraph,
    dsl: &Dsl,
    mode: AnalyticsMode,
    data_source_id: Option<&str>,
    minutes_in_range: Option<f64>,
) -> Result<()> {
    let names = graph.service_names();
    let response = ctx
        .gateway
        .search(&service_metrics_query(dsl, &names, mode), mode, data_source_id)
        .await?;
    let buckets = response
        .buckets("service_name")
        .ok_or_else(|| ServicemapError::Parse("metrics response has no service_name aggregation".into()))?;

    for bucket in buckets {
        let metrics = ServiceMetrics {
            latency: bucket.value("average_latency"),
            error_rate: bucket.value("error_rate"),
            doc_count: bucket.doc_count,
        };
        graph.apply_metrics(&bucket.key_str(), metrics, minutes_in_range);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{failure, response, FakeGateway};
    use crate::mode::IndexTarget;
    use crate::notify::CollectingNotifier;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn nodes(names: &[&str]) -> Result<SearchResponse> {
        let buckets: Vec<_> = names
            .iter()
            .map(|n| json!({ "key": n, "doc_count": 1, "target_resource": { "buckets": [] } }))
            .collect();
        response(json!({ "aggregations": { "service_name": { "buckets": buckets } } }))
    }

    fn edges(entries: &[(&str, &str, &str)]) -> Result<SearchResponse> {
        let buckets: Vec<_> = entries
            .iter()
            .map(|(service, resource, domain)| {
                json!({
                    "key": service,
                    "doc_count": 1,
                    "resource": { "buckets": [{
                        "key": resource,
                        "doc_count": 1,
                        "domain": { "buckets": [{ "key": domain, "doc_count": 1 }] }
                    }]}
                })
            })
            .collect();
        response(json!({ "aggregations": { "service_name": { "buckets": buckets } } }))
    }

    fn metrics(entries: &[(&str, f64, Option<f64>, u64)]) -> Result<SearchResponse> {
        let buckets: Vec<_> = entries
            .iter()
            .map(|(service, latency, error_rate, count)| {
                json!({
                    "key": service,
                    "doc_count": count,
                    "average_latency": { "value": latency },
                    "error_rate": { "value": error_rate }
                })
            })
            .collect();
        response(json!({ "aggregations": { "service_name": { "buckets": buckets } } }))
    }

    fn context(gateway: Arc<FakeGateway>) -> (TraceAnalytics, Arc<CollectingNotifier>) {
        let notifier = Arc::new(CollectingNotifier::new());
        let ctx = TraceAnalytics::new(gateway).with_notifier(notifier.clone());
        (ctx, notifier)
    }

    fn two_hours() -> Dsl {
        Dsl::new().with_time_range("2024-01-01T00:00:00Z", "2024-01-01T02:00:00Z")
    }

    #[tokio::test]
    async fn test_full_build() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["order", "payment"]),
            edges(&[("order", "r1", "d1")]),
            edges(&[("payment", "r1", "d1")]),
            metrics(&[("order", 20.5, Some(0.1234), 60), ("payment", 3.0, Some(0.0), 12)]),
        ]));
        let (ctx, notifier) = context(gateway.clone());

        let graph =
            build_service_map(&ctx, &two_hours(), AnalyticsMode::DataPrepper, None, true, None).await;

        assert_eq!(gateway.call_count(), 4);
        let order = graph.get("order").unwrap();
        assert_eq!(order.id, 1);
        assert_eq!(order.target_services, vec!["payment"]);
        assert!(order.dest_services.is_empty());
        assert_eq!(order.latency, Some(20.5));
        assert_eq!(order.error_rate, Some(0.12));
        assert_eq!(order.throughput, Some(60));
        assert_eq!(order.throughput_per_minute, Some(0.5));

        let payment = graph.get("payment").unwrap();
        assert_eq!(payment.id, 2);
        assert_eq!(payment.dest_services, vec!["order"]);
        assert!(payment.target_services.is_empty());
        assert_eq!(payment.error_rate, Some(0.0));
        assert!(notifier.is_empty());

        let requests = gateway.requests.lock().unwrap();
        assert_eq!(requests[0].target, IndexTarget::ServiceMap);
        assert_eq!(requests[3].target, IndexTarget::Spans);
    }

    #[tokio::test]
    async fn test_no_services_short_circuits() {
        let gateway = Arc::new(FakeGateway::new(vec![nodes(&[])]));
        let (ctx, notifier) = context(gateway.clone());
        let seen = Mutex::new(None);
        let setter = |g: &ServiceGraph| *seen.lock().unwrap() = Some(g.len());

        let graph = build_service_map(
            &ctx,
            &Dsl::new(),
            AnalyticsMode::DataPrepper,
            None,
            true,
            Some(&setter),
        )
        .await;

        assert!(graph.is_empty());
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(*seen.lock().unwrap(), Some(0));
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn test_node_failure_notifies_and_returns_empty() {
        let gateway = Arc::new(FakeGateway::new(vec![failure("connection refused")]));
        let (ctx, notifier) = context(gateway.clone());

        let graph =
            build_service_map(&ctx, &Dsl::new(), AnalyticsMode::DataPrepper, None, true, None).await;

        assert!(graph.is_empty());
        assert_eq!(gateway.call_count(), 1);
        let notes = notifier.take();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Failed to retrieve service nodes");
    }

    #[tokio::test]
    async fn test_edge_failures_are_skipped() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["order", "payment"]),
            failure("timeout"),
            edges(&[("payment", "r1", "d1")]),
            metrics(&[("order", 1.0, None, 5)]),
        ]));
        let (ctx, notifier) = context(gateway.clone());

        let graph =
            build_service_map(&ctx, &Dsl::new(), AnalyticsMode::DataPrepper, None, true, None).await;

        assert_eq!(gateway.call_count(), 4);
        assert_eq!(graph.len(), 2);
        assert!(graph.get("order").unwrap().target_services.is_empty());
        assert_eq!(graph.get("order").unwrap().throughput, Some(5));
        assert_eq!(graph.get("order").unwrap().error_rate, Some(0.0));
        assert_eq!(graph.get("order").unwrap().throughput_per_minute, None);
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_failure_leaves_metrics_unset() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["order", "payment"]),
            edges(&[("order", "r1", "d1")]),
            edges(&[("payment", "r1", "d1")]),
            failure("metrics down"),
        ]));
        let (ctx, _notifier) = context(gateway.clone());

        let graph =
            build_service_map(&ctx, &two_hours(), AnalyticsMode::DataPrepper, None, true, None).await;

        assert_eq!(graph.get("order").unwrap().target_services, vec!["payment"]);
        assert_eq!(graph.get("order").unwrap().latency, None);
        assert_eq!(graph.get("order").unwrap().throughput, None);
    }

    #[tokio::test]
    async fn test_metrics_omitted() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["order", "payment"]),
            edges(&[]),
            edges(&[]),
        ]));
        let (ctx, _notifier) = context(gateway.clone());
        let calls = Mutex::new(0);
        let setter = |_: &ServiceGraph| *calls.lock().unwrap() += 1;

        let graph = build_service_map(
            &ctx,
            &two_hours(),
            AnalyticsMode::DataPrepper,
            Some("remote"),
            false,
            Some(&setter),
        )
        .await;

        assert_eq!(gateway.call_count(), 3);
        assert_eq!(*calls.lock().unwrap(), 1);
        for node in graph.nodes() {
            assert_eq!(node.latency, None);
            assert_eq!(node.error_rate, None);
            assert_eq!(node.throughput, None);
        }
        let sources = gateway.data_sources.lock().unwrap();
        assert!(sources.iter().all(|s| s.as_deref() == Some("remote")));
    }

    #[tokio::test]
    async fn test_jaeger_skips_per_minute_throughput() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["frontend"]),
            edges(&[]),
            edges(&[]),
            metrics(&[("frontend", 4.0, Some(1.5), 60)]),
        ]));
        let (ctx, _notifier) = context(gateway);

        let graph =
            build_service_map(&ctx, &two_hours(), AnalyticsMode::Jaeger, None, true, None).await;

        let frontend = graph.get("frontend").unwrap();
        assert_eq!(frontend.throughput, Some(60));
        assert_eq!(frontend.throughput_per_minute, None);
    }
}
