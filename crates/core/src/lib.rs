use axum::error_handling::HandleErrorLayer;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use binsight_policy::{Advisory, CaptureLedger, DecisionEngine, PolicyConfig};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, BoxError, ServiceBuilder};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod chat_upstream;
mod config;
mod error;
mod events;
mod map_api;

pub use chat_upstream::{call_chat_completions, ChatAdvisory};
pub use config::{load_service_policy, ServiceFlags};
pub use error::{CoreError, Result};
pub use events::EventSink;
pub use map_api::{
    CaptureRequest, CaptureResponse, DecisionBody, ErrorBody, LabelBody, MapRequest, MetaBody,
    PointsRequest, PointsResponse, MAP_MODEL_HEADER, MAP_MODE_HEADER,
};

const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
const CORE_SERVICE_NAME: &str = "core";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";
/// Slack on top of the policy's advisory timeout for the HTTP client itself.
const ADVISORY_CLIENT_SLACK: Duration = Duration::from_secs(1);

#[derive(OpenApi)]
#[openapi(
    paths(
        health, healthz, ready,
        map_api::map_handler, map_api::capture_handler,
        map_api::points_handler, map_api::policy_handler
    ),
    components(
        schemas(
            map_api::DecisionBody,
            map_api::LabelBody,
            map_api::MetaBody,
            map_api::MapRequest,
            map_api::CaptureRequest,
            map_api::CaptureResponse,
            map_api::ErrorBody,
            map_api::PointsRequest,
            map_api::PointsResponse
        )
    ),
    tags(
        (name = "core", description = "Recycling decision endpoints")
    )
)]
pub struct ApiDoc;

/// Creates a latency histogram with predefined buckets.
fn create_latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS.into_iter())
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    flags: ServiceFlags,
    engine: DecisionEngine,
    ledger: Mutex<CaptureLedger>,
    events: Option<EventSink>,
    http_requests: Family<HttpLabels, Counter<u64>>,
    http_latency: Family<HttpDurationLabels, Histogram>,
    decisions: Family<DecisionLabels, Counter<u64>>,
    advisory_failures: Family<ReasonLabels, Counter<u64>>,
    captures_rejected: Family<ReasonLabels, Counter<u64>>,
    registry: Registry,
    ready: AtomicBool,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildInfoLabels {
    service: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpDurationLabels {
    method: String,
    path: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    method: String,
    path: &'static str,
    status: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    path: &'static str,
    material: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    reason: &'static str,
}

impl AppState {
    fn new(
        flags: ServiceFlags,
        policy: PolicyConfig,
        advisory: Option<Arc<dyn Advisory>>,
    ) -> Self {
        let mut registry = Registry::default();

        let build_info = Family::<BuildInfoLabels, Gauge>::default();
        build_info
            .get_or_create(&BuildInfoLabels {
                service: CORE_SERVICE_NAME,
            })
            .set(1);
        registry.register("build_info", "Build info per service", build_info);

        let http_requests: Family<HttpLabels, Counter<u64>> = Family::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests received",
            http_requests.clone(),
        );

        let http_latency: Family<HttpDurationLabels, Histogram> =
            Family::new_with_constructor(create_latency_histogram);
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration",
            http_latency.clone(),
        );

        let decisions: Family<DecisionLabels, Counter<u64>> = Family::default();
        registry.register(
            "decisions",
            "Decisions by deciding path and material",
            decisions.clone(),
        );

        let advisory_failures: Family<ReasonLabels, Counter<u64>> = Family::default();
        registry.register(
            "advisory_failures",
            "Advisory attempts that fell back to the heuristic",
            advisory_failures.clone(),
        );

        let captures_rejected: Family<ReasonLabels, Counter<u64>> = Family::default();
        registry.register(
            "captures_rejected",
            "Captures rejected by the ledger",
            captures_rejected.clone(),
        );

        let ledger = Mutex::new(CaptureLedger::new(policy.capture.clone()));
        let mut engine = DecisionEngine::new(Arc::new(policy));
        if let Some(advisory) = advisory {
            engine = engine.with_advisory(advisory);
        }
        let events = flags.events_dir().map(EventSink::new);

        Self(Arc::new(AppStateInner {
            flags,
            engine,
            ledger,
            events,
            http_requests,
            http_latency,
            decisions,
            advisory_failures,
            captures_rejected,
            registry,
            ready: AtomicBool::new(false),
        }))
    }

    pub fn flags(&self) -> &ServiceFlags {
        &self.0.flags
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.0.engine
    }

    /// Runs `f` with exclusive access to the capture ledger.
    pub(crate) fn with_ledger<T>(&self, f: impl FnOnce(&mut CaptureLedger) -> T) -> T {
        let mut ledger = self.0.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ledger)
    }

    pub(crate) fn emit(&self, kind: &str, payload: Value) {
        if let Some(sink) = &self.0.events {
            sink.write(kind, payload);
        }
    }

    fn encode_metrics(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.0.registry)?;
        Ok(body)
    }

    pub fn record_http_observation(
        &self,
        method: Method,
        path: &'static str,
        status: StatusCode,
        started: Instant,
    ) {
        let elapsed = started.elapsed().as_secs_f64();
        self.0
            .http_requests
            .get_or_create(&HttpLabels {
                method: method.as_str().to_string(),
                path,
                status: status.as_str().to_string(),
            })
            .inc();
        self.0
            .http_latency
            .get_or_create(&HttpDurationLabels {
                method: method.as_str().to_string(),
                path,
            })
            .observe(elapsed);
    }

    pub(crate) fn record_decision_metric(&self, path: &'static str, material: &'static str) {
        self.0
            .decisions
            .get_or_create(&DecisionLabels { path, material })
            .inc();
    }

    pub(crate) fn record_advisory_failure(&self, reason: &'static str) {
        self.0
            .advisory_failures
            .get_or_create(&ReasonLabels { reason })
            .inc();
    }

    pub(crate) fn record_capture_rejection(&self, reason: &'static str) {
        self.0
            .captures_rejected
            .get_or_create(&ReasonLabels { reason })
            .inc();
    }

    pub fn set_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }
}

fn liveness(state: &AppState, path: &'static str) -> &'static str {
    state.record_http_observation(Method::GET, path, StatusCode::OK, Instant::now());
    "ok"
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Process alive")),
    tag = "core"
)]
async fn health(State(state): State<AppState>) -> &'static str {
    liveness(&state, "/health")
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process alive")),
    tag = "core"
)]
async fn healthz(State(state): State<AppState>) -> &'static str {
    liveness(&state, "/healthz")
}

#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Listener bound, accepting decisions"),
        (status = 503, description = "Still starting up")
    ),
    tag = "core"
)]
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let started = Instant::now();
    let reply = match state.is_ready() {
        true => (StatusCode::OK, "ready"),
        false => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
    };
    state.record_http_observation(Method::GET, "/ready", reply.0, started);
    reply
}

async fn metrics(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    match state.encode_metrics() {
        Ok(body) => {
            state.record_http_observation(Method::GET, "/metrics", StatusCode::OK, started);
            ([(header::CONTENT_TYPE, PROMETHEUS_TEXT)], body).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            state.record_http_observation(Method::GET, "/metrics", status, started);
            status.into_response()
        }
    }
}

/// Advisory configured through the flags, if any.
pub fn advisory_from_flags(
    flags: &ServiceFlags,
    policy: &PolicyConfig,
) -> Option<Arc<dyn Advisory>> {
    let url = flags.advisory_url.clone()?;
    let client = reqwest::Client::builder()
        .timeout(policy.advisory.timeout() + ADVISORY_CLIENT_SLACK)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("failed to build http client, falling back to default: {}", e);
            reqwest::Client::new()
        });
    tracing::info!(url = %url, model = %flags.advisory_model, "advisory enabled");
    Some(Arc::new(ChatAdvisory::new(
        client,
        url,
        flags.advisory_key.clone(),
        flags.advisory_model.clone(),
    )))
}

pub fn build_app(policy: PolicyConfig, flags: ServiceFlags, allowed_origin: HeaderValue) -> Router {
    build_app_with_state(policy, flags, allowed_origin).0
}

pub fn build_app_with_state(
    policy: PolicyConfig,
    flags: ServiceFlags,
    allowed_origin: HeaderValue,
) -> (Router, AppState) {
    let advisory = advisory_from_flags(&flags, &policy);
    build_app_with_advisory(policy, flags, allowed_origin, advisory)
}

pub fn build_app_with_advisory(
    policy: PolicyConfig,
    flags: ServiceFlags,
    allowed_origin: HeaderValue,
    advisory: Option<Arc<dyn Advisory>>,
) -> (Router, AppState) {
    let timeout_ms = flags.http_timeout_ms;
    let concurrency = flags.http_concurrency;
    let state = AppState::new(flags, policy, advisory);
    let allowed_origin = Arc::new(allowed_origin);

    let mut app = Router::new().merge(core_routes()).merge(decision_routes());

    if state.flags().expose_docs {
        // OpenAPI UI under /docs, spec under /api-docs/openapi.json
        let swagger = SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi());
        app = app.merge(swagger);
    }

    let timeout_layer = if timeout_ms > 0 {
        Some(TimeoutLayer::new(Duration::from_millis(timeout_ms)))
    } else {
        tracing::info!("BINSIGHT_HTTP_TIMEOUT_MS=0 → request timeout disabled");
        None
    };
    let concurrency_layer = if concurrency > 0 {
        let c = usize::try_from(concurrency).unwrap_or(usize::MAX);
        Some(ConcurrencyLimitLayer::new(c))
    } else {
        tracing::info!("BINSIGHT_HTTP_CONCURRENCY=0 → concurrency limit disabled");
        None
    };

    let request_guards = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                (StatusCode::REQUEST_TIMEOUT, "request timed out")
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "service temporarily unavailable",
                )
            }
        }))
        .option_layer(timeout_layer)
        .option_layer(concurrency_layer)
        // Both `option_layer` branches must share an error type.
        .layer(tower::util::MapErrLayer::new(
            |e: std::convert::Infallible| -> BoxError { match e {} },
        ));

    // The readiness flag is set by the caller once the listener is bound.
    let app = app
        .with_state(state.clone())
        .layer(from_fn_with_state(allowed_origin, cors_middleware))
        .layer(request_guards);

    (app, state)
}

fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
}

fn decision_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/map", post(map_api::map_handler))
        .route("/api/map", post(map_api::legacy_map_handler))
        .route("/v1/capture", post(map_api::capture_handler))
        .route("/v1/points", post(map_api::points_handler))
        .route("/v1/policy", get(map_api::policy_handler))
}

type CorsState = Arc<HeaderValue>;

async fn cors_middleware(
    State(allowed_origin): State<CorsState>,
    req: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let origin_allowed = origin.as_ref() == Some(allowed_origin.as_ref());

    if req.method() == Method::OPTIONS {
        if !origin_allowed {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
        }

        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                allowed_origin.as_ref().clone(),
            )
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, POST, OPTIONS")
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            )
            .header(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"))
            .header(header::VARY, HeaderValue::from_static("Origin"))
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = next.run(req).await;
    if origin_allowed {
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            allowed_origin.as_ref().clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("x-map-mode, x-map-model"),
        );
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, HeaderValue, Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn demo_app_with(flags: ServiceFlags, origin: HeaderValue) -> (axum::Router, AppState) {
        let (app, state) =
            build_app_with_advisory(PolicyConfig::default(), flags, origin, None);
        state.set_ready();
        (app, state)
    }

    fn demo_app() -> axum::Router {
        demo_app_with(
            ServiceFlags::default(),
            HeaderValue::from_static("http://127.0.0.1:8080"),
        )
        .0
    }

    async fn body_text(res: Response) -> String {
        let body = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_ok_and_metrics_increment() {
        let app = demo_app();

        let res = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = body_text(res).await;

        let expected_health = r#"http_requests_total{method="GET",path="/health",status="200"} 1"#;
        assert!(
            text.contains(expected_health),
            "metrics missing labeled health counter:\n{text}"
        );
        assert!(text.contains(r#"build_info{service="core"} 1"#));
    }

    #[tokio::test]
    async fn latency_histogram_is_exported() {
        let app = demo_app();
        for _ in 0..5 {
            let _ = app
                .clone()
                .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
                .await
                .unwrap();
        }
        let res = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = body_text(res).await;
        assert!(text.contains("http_request_duration_seconds_bucket"));
    }

    #[tokio::test]
    async fn readiness_follows_flag() {
        let (app, state) = build_app_with_advisory(
            PolicyConfig::default(),
            ServiceFlags::default(),
            HeaderValue::from_static("http://127.0.0.1:8080"),
            None,
        );
        let res = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let res = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn docs_hidden_by_default_and_served_when_enabled() {
        let res = demo_app()
            .oneshot(
                Request::get("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let flags = ServiceFlags {
            expose_docs: true,
            ..ServiceFlags::default()
        };
        let (app, _state) = demo_app_with(flags, HeaderValue::from_static("*"));
        let res = app
            .oneshot(
                Request::get("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let text = body_text(res).await;
        assert!(text.contains("/v1/map"));
        assert!(text.contains("/v1/capture"));
    }

    fn with_origin(method: Method, uri: &str, origin: &'static str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ORIGIN, HeaderValue::from_static(origin))
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn cors_echoes_only_the_configured_origin() {
        let app = demo_app();

        let res = app
            .clone()
            .oneshot(with_origin(Method::GET, "/healthz", "http://127.0.0.1:8080"))
            .await
            .unwrap();
        let headers = res.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://127.0.0.1:8080"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_EXPOSE_HEADERS).unwrap(),
            "x-map-mode, x-map-model"
        );

        let res = app
            .clone()
            .oneshot(with_origin(Method::GET, "/healthz", "https://bins.example"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        let res = app
            .clone()
            .oneshot(with_origin(Method::OPTIONS, "/v1/capture", "https://bins.example"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .oneshot(with_origin(Method::OPTIONS, "/v1/capture", "http://127.0.0.1:8080"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let methods = res.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap();
        assert!(methods.contains("POST"));
    }

    #[tokio::test]
    async fn events_are_written_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let flags = ServiceFlags {
            events: true,
            data_dir: tmp.path().to_path_buf(),
            ..ServiceFlags::default()
        };
        let (app, _state) = demo_app_with(flags, HeaderValue::from_static("*"));
        let res = app
            .oneshot(
                Request::post("/v1/map")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"labels":[{"name":"bottle","prob":0.9}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let sink = EventSink::new(tmp.path().join("events"));
        let content = std::fs::read_to_string(sink.file_for(chrono::Utc::now())).unwrap();
        assert!(content.contains("\"kind\":\"decision.made\""));
        assert!(content.contains("\"material\":\"plastic\""));
    }
}
