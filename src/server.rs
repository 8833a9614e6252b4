//! HTTP surface: trace-analytics read routes and the chat proxy.

use crate::analytics::TraceAnalytics;
use crate::chat::{ChatClient, ChatMessageRequest};
use crate::config::Config;
use crate::dsl::Dsl;
use crate::error::{Result, ServicemapError};
use crate::gateway::{HttpSearchGateway, SearchGateway};
use crate::graph::ServiceGraph;
use crate::mode::AnalyticsMode;
use crate::notify::CollectingNotifier;
use crate::query::QueryLimits;
use crate::refresh::{scope_key, MapRefresher};
use crate::services::{list_services, parse_fixed_interval, service_trends, service_view};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const API_PREFIX: &str = "/api/observability";

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub analytics: TraceAnalytics,
    pub chat: Arc<ChatClient>,
    pub refresher: MapRefresher,
    pub default_mode: AnalyticsMode,
}

impl AppState {
    pub fn new(gateway: Arc<dyn SearchGateway>, chat: ChatClient, config: &Config) -> Self {
        let limits = QueryLimits {
            max_nodes: config.search.max_nodes,
            max_edges: config.search.max_edges,
        };
        Self {
            analytics: TraceAnalytics::new(gateway).with_limits(limits),
            chat: Arc::new(chat),
            refresher: MapRefresher::new(),
            default_mode: config.servicemap.default_mode,
        }
    }

    /// Analytics handle that records notifications for one request
    fn scoped(&self) -> (TraceAnalytics, Arc<CollectingNotifier>) {
        let notifier = Arc::new(CollectingNotifier::new());
        (self.analytics.clone().with_notifier(notifier.clone()), notifier)
    }
}

/// HTTP server wrapper
pub struct HttpServer {
    state: AppState,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
}

impl HttpServer {
    pub fn new(config: &Config) -> Result<Self> {
        let gateway = Arc::new(HttpSearchGateway::new(config.search.clone())?);
        let chat = ChatClient::new(&config.chat)?;
        Ok(Self {
            state: AppState::new(gateway, chat, config),
            host: config.http_server.host.clone(),
            port: config.http_server.port,
            allowed_origins: config.http_server.allowed_origins.clone(),
        })
    }

    /// Run the HTTP server
    pub async fn run(&self) -> Result<()> {
        let app = build_router(self.state.clone(), &self.allowed_origins);

        let addr = format!("{}:{}", self.host, self.port);
        log::info!("Starting service map server on http://{}", addr);
        log::info!("Trace analytics routes under http://{}{}", addr, API_PREFIX);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            ServicemapError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to bind to {}: {}. Set http_server.port in config.toml to use a different port.",
                    addr, e
                ),
            ))
        })?;

        axum::serve(listener, app).await.map_err(|e| {
            ServicemapError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("HTTP server error: {}", e),
            ))
        })?;

        Ok(())
    }
}

/// Create the axum router
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    // No configured origins means local development: allow any
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let trace_analytics = Router::new()
        .route("/service_map", get(handle_service_map))
        .route("/services", get(handle_services))
        .route("/services/:name", get(handle_service_view))
        .route("/service_trends", get(handle_service_trends));

    Router::new()
        .route("/health", get(handle_health))
        .route(&format!("{}/chat/message", API_PREFIX), post(handle_chat_message))
        .nest(&format!("{}/trace_analytics", API_PREFIX), trace_analytics)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Query parameters shared by the trace-analytics routes
#[derive(Debug, Default, Deserialize)]
struct AnalyticsParams {
    mode: Option<String>,
    start: Option<String>,
    end: Option<String>,
    data_source_id: Option<String>,
    include_metrics: Option<bool>,
    service: Option<String>,
    interval: Option<String>,
    /// Groups map rebuilds for last-request-wins; defaults to mode + data source
    session: Option<String>,
}

impl AnalyticsParams {
    fn mode(&self, default: AnalyticsMode) -> Result<AnalyticsMode> {
        match self.mode.as_deref() {
            Some(mode) => mode.parse(),
            None => Ok(default),
        }
    }

    fn dsl(&self) -> Result<Dsl> {
        let mut dsl = Dsl::new();
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => dsl = dsl.with_time_range(start.as_str(), end.as_str()),
            (None, None) => {}
            _ => {
                return Err(ServicemapError::InvalidInput(
                    "start and end must be given together".to_string(),
                ))
            }
        }
        if let Some(service) = &self.service {
            dsl = dsl.with_service_name(service.as_str());
        }
        Ok(dsl)
    }

    fn parse(&self, default_mode: AnalyticsMode) -> Result<(AnalyticsMode, Dsl)> {
        Ok((self.mode(default_mode)?, self.dsl()?))
    }

    fn data_source_id(&self) -> Option<&str> {
        self.data_source_id.as_deref().filter(|id| !id.is_empty())
    }

    fn scope(&self, mode: AnalyticsMode) -> String {
        scope_key(self.session.as_deref(), mode, self.data_source_id())
    }
}

fn error_response(error: &ServicemapError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

fn with_notifications(mut body: Value, notifier: &CollectingNotifier) -> Response {
    body["notifications"] = json!(notifier.take());
    (StatusCode::OK, Json(body)).into_response()
}

/// Handle health check
async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "servicemap",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

/// Service map for the requested window. A rebuild overtaken by a newer one
/// in the same scope still answers with its own graph, flagged `superseded`.
async fn handle_service_map(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Response {
    let (mode, dsl) = match params.parse(state.default_mode) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let (ctx, notifier) = state.scoped();
    let include_metrics = params.include_metrics.unwrap_or(true);

    let refresh = state
        .refresher
        .refresh(&params.scope(mode), &ctx, &dsl, mode, params.data_source_id(), include_metrics)
        .await;

    with_notifications(
        json!({ "service_map": refresh.graph().as_ref(), "superseded": refresh.is_superseded() }),
        &notifier,
    )
}

async fn handle_services(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Response {
    let (mode, dsl) = match params.parse(state.default_mode) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let (ctx, notifier) = state.scoped();

    // The graph built for the table is also published as the scope's map
    let ticket = state.refresher.begin(&params.scope(mode));
    let captured: Mutex<Option<ServiceGraph>> = Mutex::new(None);
    let setter = |graph: &ServiceGraph| {
        let mut slot = match captured.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(graph.clone());
    };
    let services = list_services(&ctx, &dsl, mode, params.data_source_id(), Some(&setter)).await;
    let captured = match captured.into_inner() {
        Ok(graph) => graph,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(graph) = captured {
        state.refresher.publish(&ticket, graph);
    }

    with_notifications(json!({ "services": services }), &notifier)
}

async fn handle_service_view(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Response {
    let (mode, dsl) = match params.parse(state.default_mode) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let (ctx, notifier) = state.scoped();

    match service_view(&ctx, &name, &dsl, mode, params.data_source_id()).await {
        Some(service) => with_notifications(json!({ "service": service }), &notifier),
        None => {
            let mut body = json!({ "error": format!("Service not found: {}", name) });
            body["notifications"] = json!(notifier.take());
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

async fn handle_service_trends(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Response {
    let (mode, dsl) = match params.parse(state.default_mode) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let interval = params.interval.as_deref().unwrap_or("1m");
    if let Err(e) = parse_fixed_interval(interval) {
        return error_response(&e);
    }
    let (ctx, notifier) = state.scoped();

    let trends = service_trends(&ctx, &dsl, mode, interval, params.data_source_id()).await;
    with_notifications(json!({ "trends": trends }), &notifier)
}

/// Forward a chat message. Failures come back as
/// `{"message": "Error processing chat message: ..."}`.
async fn handle_chat_message(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let result = match ChatMessageRequest::from_body(&body) {
        Ok(request) => state.chat.send(&request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(reply) => (StatusCode::OK, Json(json!(reply))).into_response(),
        Err(e) => {
            log::error!("Chat message failed: {}", e);
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({ "message": format!("Error processing chat message: {}", e) })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, Config};
    use crate::gateway::testing::{failure, response, FakeGateway};
    use crate::gateway::SearchResponse;
    use crate::query::SearchRequest;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const TEST_CONFIG: &str = r#"
[search]
endpoint = "http://localhost:9200"
"#;

    fn state_with(gateway: Arc<FakeGateway>, chat_url: &str) -> AppState {
        let config = Config::from_toml(TEST_CONFIG).unwrap();
        let chat = ChatClient::new(&ChatConfig {
            upstream_url: chat_url.to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        AppState::new(gateway, chat, &config)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn nodes(names: &[&str]) -> crate::error::Result<crate::gateway::SearchResponse> {
        let buckets: Vec<_> = names.iter().map(|n| json!({ "key": n, "doc_count": 1 })).collect();
        response(json!({ "aggregations": { "service_name": { "buckets": buckets } } }))
    }

    fn empty_edges() -> crate::error::Result<crate::gateway::SearchResponse> {
        response(json!({ "aggregations": { "service_name": { "buckets": [] } } }))
    }

    #[tokio::test]
    async fn test_health() {
        let gateway = Arc::new(FakeGateway::new(vec![]));
        let router = build_router(state_with(gateway, "http://127.0.0.1:9/search"), &[]);
        let (status, body) = send(router, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_service_map_route() {
        let gateway = Arc::new(FakeGateway::new(vec![
            nodes(&["order", "payment"]),
            empty_edges(),
            empty_edges(),
        ]));
        let state = state_with(gateway.clone(), "http://127.0.0.1:9/search");
        let router = build_router(state.clone(), &[]);

        let (status, body) = send(
            router,
            get_request("/api/observability/trace_analytics/service_map?mode=jaeger&include_metrics=false&data_source_id=ds1"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["superseded"], false);
        assert_eq!(body["service_map"]["order"]["id"], 1);
        assert_eq!(body["service_map"]["payment"]["id"], 2);
        assert!(body["notifications"].as_array().unwrap().is_empty());
        assert_eq!(gateway.call_count(), 3);
        assert_eq!(gateway.data_sources.lock().unwrap()[0].as_deref(), Some("ds1"));
        assert!(state.refresher.latest("jaeger|ds1").unwrap().contains("order"));
    }

    #[tokio::test]
    async fn test_service_map_reports_notifications() {
        let gateway = Arc::new(FakeGateway::new(vec![failure("cluster down")]));
        let router = build_router(state_with(gateway, "http://127.0.0.1:9/search"), &[]);

        let (status, body) = send(router, get_request("/api/observability/trace_analytics/service_map")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service_map"], json!({}));
        assert_eq!(body["notifications"][0]["title"], "Failed to retrieve service nodes");
    }

    #[tokio::test]
    async fn test_bad_params_rejected() {
        let gateway = Arc::new(FakeGateway::new(vec![]));
        let state = state_with(gateway.clone(), "http://127.0.0.1:9/search");

        let (status, _) = send(
            build_router(state.clone(), &[]),
            get_request("/api/observability/trace_analytics/services?mode=zipkin"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            build_router(state, &[]),
            get_request("/api/observability/trace_analytics/service_map?start=now-15m"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_service_view_not_found() {
        let gateway = Arc::new(FakeGateway::new(vec![
            response(json!({ "aggregations": { "service": { "buckets": [] } } })),
            nodes(&[]),
        ]));
        let router = build_router(state_with(gateway, "http://127.0.0.1:9/search"), &[]);

        let (status, body) = send(
            router,
            get_request("/api/observability/trace_analytics/services/order?start=now-1h&end=now"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("order"));
    }

    #[tokio::test]
    async fn test_chat_legacy_body_rejected() {
        let gateway = Arc::new(FakeGateway::new(vec![]));
        let router = build_router(state_with(gateway, "http://127.0.0.1:9/search"), &[]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/observability/chat/message")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message": "hello"}"#))
            .unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("Error processing chat message:"));
    }

    #[tokio::test]
    async fn test_chat_upstream_status_passed_through() {
        let upstream = Router::new().route(
            "/search",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let gateway = Arc::new(FakeGateway::new(vec![]));
        let router = build_router(state_with(gateway, &format!("http://{}/search", addr)), &[]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/observability/chat/message")
            .body(Body::from(r#"{"log": "row", "query": "why"}"#))
            .unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["message"].as_str().unwrap().contains("503"));
    }

    fn services_response(entries: &[(&str, u64)]) -> crate::error::Result<SearchResponse> {
        let buckets: Vec<_> = entries
            .iter()
            .map(|(name, traces)| json!({ "key": name, "doc_count": 5, "trace_count": { "value": traces } }))
            .collect();
        response(json!({ "aggregations": { "service": { "buckets": buckets } } }))
    }

    #[tokio::test]
    async fn test_services_route_publishes_map() {
        let gateway = Arc::new(FakeGateway::new(vec![
            services_response(&[("order", 4)]),
            nodes(&["order", "payment"]),
            empty_edges(),
            empty_edges(),
            empty_edges(),
        ]));
        let state = state_with(gateway.clone(), "http://127.0.0.1:9/search");

        let (status, body) = send(
            build_router(state.clone(), &[]),
            get_request("/api/observability/trace_analytics/services?start=now-1h&end=now"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["services"][0]["name"], "order");
        assert_eq!(body["services"][0]["traces"], 4);
        assert_eq!(gateway.call_count(), 5);
        let published = state.refresher.latest("data_prepper|").unwrap();
        assert!(published.contains("order"));
        assert!(published.contains("payment"));
    }

    #[tokio::test]
    async fn test_service_trends_route_default_interval() {
        let gateway = Arc::new(FakeGateway::new(vec![response(json!({
            "aggregations": { "service_trends": { "buckets": [{
                "key": "order",
                "doc_count": 1,
                "time_buckets": { "buckets": [{
                    "key": 1704067200000i64,
                    "doc_count": 1,
                    "average_latency": { "value": 3.0 },
                    "trace_count": { "value": 1 },
                    "error_rate": { "value": 0.0 }
                }]}
            }]}}
        }))]));
        let router = build_router(state_with(gateway.clone(), "http://127.0.0.1:9/search"), &[]);

        let (status, body) = send(router, get_request("/api/observability/trace_analytics/service_trends")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trends"]["order"]["latency_trend"]["y"][0], 3.0);
        assert_eq!(
            body["trends"]["order"]["throughput"]["labels"][0],
            "01/01/2024 00:00:00 - 01/01/2024 00:01:00"
        );
        let requests = gateway.requests.lock().unwrap();
        assert_eq!(
            requests[0].body["aggs"]["service_trends"]["aggs"]["time_buckets"]["date_histogram"]["fixed_interval"],
            "1m"
        );
    }

    #[tokio::test]
    async fn test_service_trends_route_rejects_bad_interval() {
        let gateway = Arc::new(FakeGateway::new(vec![]));
        let state = state_with(gateway.clone(), "http://127.0.0.1:9/search");

        for interval in ["5w", "999999999999999d", "0m"] {
            let (status, body) = send(
                build_router(state.clone(), &[]),
                get_request(&format!(
                    "/api/observability/trace_analytics/service_trends?interval={}",
                    interval
                )),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "interval {}", interval);
            assert!(body["error"].as_str().unwrap().contains("nterval"));
        }
        assert_eq!(gateway.call_count(), 0);
    }

    /// Delays the first node discovery it sees; answers by query shape.
    struct OverlapGateway {
        node_calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchGateway for OverlapGateway {
        async fn search(
            &self,
            request: &SearchRequest,
            _mode: AnalyticsMode,
            _data_source_id: Option<&str>,
        ) -> crate::error::Result<SearchResponse> {
            let aggs = &request.body["aggs"];
            if aggs["service"].is_object() {
                return services_response(&[("order", 2)]);
            }
            if aggs["service_name"]["aggs"]["target_resource"].is_object() {
                if self.node_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                return nodes(&["order"]);
            }
            empty_edges()
        }
    }

    #[tokio::test]
    async fn test_overtaken_service_map_keeps_own_graph() {
        let config = Config::from_toml(TEST_CONFIG).unwrap();
        let chat = ChatClient::new(&config.chat).unwrap();
        let gateway = Arc::new(OverlapGateway {
            node_calls: AtomicUsize::new(0),
        });
        let state = AppState::new(gateway, chat, &config);

        let map = send(
            build_router(state.clone(), &[]),
            get_request("/api/observability/trace_analytics/service_map?start=now-1h&end=now"),
        );
        let services = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            send(
                build_router(state.clone(), &[]),
                get_request("/api/observability/trace_analytics/services?start=now-1h&end=now"),
            )
            .await
        };
        let ((map_status, map_body), (services_status, services_body)) = tokio::join!(map, services);

        assert_eq!(map_status, StatusCode::OK);
        assert_eq!(map_body["superseded"], true);
        assert_eq!(map_body["service_map"]["order"]["id"], 1);
        assert_eq!(services_status, StatusCode::OK);
        assert_eq!(services_body["services"][0]["name"], "order");
        assert!(state.refresher.latest("data_prepper|").unwrap().contains("order"));
    }

    #[tokio::test]
    async fn test_sessions_do_not_supersede_each_other() {
        let config = Config::from_toml(TEST_CONFIG).unwrap();
        let chat = ChatClient::new(&config.chat).unwrap();
        let gateway = Arc::new(OverlapGateway {
            node_calls: AtomicUsize::new(0),
        });
        let state = AppState::new(gateway, chat, &config);

        let first = send(
            build_router(state.clone(), &[]),
            get_request("/api/observability/trace_analytics/service_map?session=a"),
        );
        let second = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            send(
                build_router(state.clone(), &[]),
                get_request("/api/observability/trace_analytics/service_map?session=b"),
            )
            .await
        };
        let ((_, first), (_, second)) = tokio::join!(first, second);

        assert_eq!(first["superseded"], false);
        assert_eq!(second["superseded"], false);
        assert!(state.refresher.latest("session:a").is_some());
        assert!(state.refresher.latest("session:b").is_some());
    }
}
