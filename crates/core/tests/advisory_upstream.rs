use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::State,
    http::{self, HeaderMap, HeaderValue, Request, StatusCode},
    routing::post,
    Json, Router,
};
use binsight_core::{build_app_with_state, ChatAdvisory, ServiceFlags, MAP_MODE_HEADER, MAP_MODEL_HEADER};
use binsight_policy::{Advisory, AdvisoryError, AdvisoryRequest, Label, Meta, PolicyConfig, RuleTable};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

#[derive(Clone)]
struct Upstream {
    status: StatusCode,
    content: String,
    seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn completions(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    upstream.seen.lock().unwrap().push((auth, body));
    (
        upstream.status,
        Json(json!({"choices": [{"message": {"role": "assistant", "content": upstream.content}}]})),
    )
}

/// Serves a fake chat completions endpoint and returns its URL.
async fn spawn_upstream(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1/chat/completions")
}

fn upstream(status: StatusCode, content: &str) -> Upstream {
    Upstream {
        status,
        content: content.to_string(),
        seen: Arc::new(Mutex::new(Vec::new())),
    }
}

fn request() -> AdvisoryRequest {
    AdvisoryRequest::new(
        vec![Label::new("jar", 0.9)],
        &RuleTable::new(),
        Meta::default(),
    )
}

#[tokio::test]
async fn chat_advisory_extracts_fenced_reply() {
    let fake = upstream(
        StatusCode::OK,
        "```json\n{\"material\":\"glass\",\"bin\":\"recycling\",\"years\":1000000}\n```",
    );
    let seen = fake.seen.clone();
    let url = spawn_upstream(fake).await;

    let advisory = ChatAdvisory::new(
        reqwest::Client::new(),
        url,
        Some("secret".into()),
        "tiny".into(),
    );
    let value = advisory.propose(&request()).await.unwrap();
    assert_eq!(value["material"], "glass");
    assert_eq!(advisory.model(), "tiny");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (auth, body) = &seen[0];
    assert_eq!(auth.as_deref(), Some("Bearer secret"));
    assert_eq!(body["model"], "tiny");
    assert_eq!(body["temperature"], 0.0);
    assert_eq!(body["messages"][0]["role"], "user");
    assert!(body["messages"][0]["content"]
        .as_str()
        .unwrap()
        .contains("OUTPUT ONLY JSON"));
}

#[tokio::test]
async fn chat_advisory_reports_status_and_parse_errors() {
    let url = spawn_upstream(upstream(StatusCode::SERVICE_UNAVAILABLE, "")).await;
    let advisory = ChatAdvisory::new(reqwest::Client::new(), url, None, "tiny".into());
    assert!(matches!(
        advisory.propose(&request()).await,
        Err(AdvisoryError::Status(503))
    ));

    let url = spawn_upstream(upstream(StatusCode::OK, "I would rather not.")).await;
    let advisory = ChatAdvisory::new(reqwest::Client::new(), url, None, "tiny".into());
    assert!(matches!(
        advisory.propose(&request()).await,
        Err(AdvisoryError::Parse(_))
    ));
}

#[tokio::test]
async fn unreachable_upstream_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let advisory = ChatAdvisory::new(
        reqwest::Client::new(),
        format!("http://{addr}/v1/chat/completions"),
        None,
        "tiny".into(),
    );
    assert!(matches!(
        advisory.propose(&request()).await,
        Err(AdvisoryError::Transport(_))
    ));
}

#[tokio::test]
async fn service_uses_configured_upstream() {
    let url = spawn_upstream(upstream(
        StatusCode::OK,
        r#"{"material":"metal","bin":"recycling","tip":"Rinse the can.","years":200,"risk_score":0.05}"#,
    ))
    .await;
    let flags = ServiceFlags {
        advisory_url: Some(url),
        advisory_model: "tiny".into(),
        ..ServiceFlags::default()
    };
    let (app, _state) =
        build_app_with_state(PolicyConfig::default(), flags, HeaderValue::from_static("*"));

    let response = app
        .oneshot(
            Request::post("/v1/map")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"labels": [{"name": "soda can", "prob": 0.9}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(MAP_MODE_HEADER).unwrap(), "advisory");
    assert_eq!(response.headers().get(MAP_MODEL_HEADER).unwrap(), "tiny");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["material"], "metal");
    assert_eq!(body["tip"], "Rinse the can.");
    assert_eq!(body["risk_score"], 0.05);
}
