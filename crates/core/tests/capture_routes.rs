use axum::{
    body::Body,
    http::{self, HeaderValue, Request, StatusCode},
    Router,
};
use binsight_core::{build_app_with_advisory, ServiceFlags};
use binsight_policy::PolicyConfig;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

/// Pairwise at least eight bits apart, so none is a near-duplicate of another.
const FRAMES: [&str; 7] = [
    "0000000000000000",
    "00000000000000ff",
    "000000000000ff00",
    "0000000000ff0000",
    "00000000ff000000",
    "000000ff00000000",
    "0000ff0000000000",
];

fn app() -> Router {
    let (app, state) = build_app_with_advisory(
        PolicyConfig::default(),
        ServiceFlags::default(),
        HeaderValue::from_static("*"),
        None,
    );
    state.set_ready();
    app
}

fn capture(bin: &str, ahash: &str, motion: f64) -> Value {
    json!({
        "team_id": "team-7",
        "bin_id": bin,
        "ahash": ahash,
        "labels": [{"name": "bottle", "prob": 0.9}],
        "motion_delta": motion
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body bytes")
        .to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn post_json(app: &Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    send(
        app,
        Request::post(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("failed to build request"),
    )
    .await
}

#[tokio::test]
async fn accepted_capture_returns_decision_and_points() {
    let app = app();

    let (status, body) = post_json(&app, "/v1/capture", &capture("bin-1", FRAMES[0], 0.4)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"]["material"], "plastic");
    assert_eq!(body["decision"]["bin"], "recycling");
    assert_eq!(body["points"], 450);
    assert_eq!(body["ahash"], "0000000000000000");
    assert_eq!(body["mode"], "heuristic");
    assert_eq!(body["model"], "");
}

#[tokio::test]
async fn near_duplicate_is_rejected_per_bin() {
    let app = app();
    let first = post_json(&app, "/v1/capture", &capture("bin-1", "00000000000000f0", 0.4)).await;
    assert_eq!(first.0, StatusCode::OK);

    // Two bits away from the first frame.
    let (status, body) =
        post_json(&app, "/v1/capture", &capture("bin-1", "00000000000000f3", 0.4)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "duplicate");

    // Another bin has its own history.
    let (status, _) =
        post_json(&app, "/v1/capture", &capture("bin-2", "00000000000000f3", 0.4)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn static_frame_and_bad_hash_are_unprocessable() {
    let app = app();

    let (status, body) = post_json(&app, "/v1/capture", &capture("bin-1", FRAMES[0], 0.0)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["reason"], "static_frame");

    let (status, body) =
        post_json(&app, "/v1/capture", &capture("bin-1", "not-a-hash", 0.4)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["reason"], "invalid_hash");

    // Rejections leave no trace in the ledger.
    let (status, _) = post_json(&app, "/v1/capture", &capture("bin-1", FRAMES[0], 0.4)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        Request::post("/v1/capture")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"team_id": 7}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "malformed_body");
}

#[tokio::test]
async fn missing_motion_delta_is_a_bad_request() {
    let app = app();
    let mut body = capture("bin-1", FRAMES[0], 0.4);
    body.as_object_mut().unwrap().remove("motion_delta");

    let (status, reply) = post_json(&app, "/v1/capture", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(reply["reason"], "malformed_body");
    assert!(reply["error"].as_str().unwrap_or_default().contains("motion_delta"));

    // The camera's camelCase spelling is accepted.
    let mut body = capture("bin-1", FRAMES[0], 0.4);
    let motion = body.as_object_mut().unwrap().remove("motion_delta").unwrap();
    body["motionDelta"] = motion;
    let (status, _) = post_json(&app, "/v1/capture", &body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn hourly_cap_and_busy_discount() {
    let app = app();
    let mut points = Vec::new();
    for frame in &FRAMES[..6] {
        let (status, body) = post_json(&app, "/v1/capture", &capture("bin-9", frame, 0.4)).await;
        assert_eq!(status, StatusCode::OK, "frame {frame}: {body}");
        points.push(body["points"].as_u64().unwrap());
    }
    // Three or more recent captures mark the bin as busy.
    assert_eq!(points, vec![450, 450, 450, 416, 416, 416]);

    let (status, body) = post_json(&app, "/v1/capture", &capture("bin-9", FRAMES[6], 0.4)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], "hourly_cap");

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(
        text.contains(r#"captures_rejected_total{reason="hourly_cap"} 1"#),
        "missing rejection counter:\n{text}"
    );
}

#[tokio::test]
async fn points_endpoint_discounts_risk() {
    let app = app();

    let (status, body) =
        post_json(&app, "/v1/points", &json!({"years": 450, "risk_score": 1.0})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["points"], 225);

    let (_, body) = post_json(&app, "/v1/points", &json!({"years": 0.2})).await;
    assert_eq!(body["points"], 1);
}

#[tokio::test]
async fn policy_endpoint_resolves_every_material() {
    let app = app();
    let (status, body) = send(
        &app,
        Request::get("/v1/policy").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let rules = body["rules"].as_object().unwrap();
    assert_eq!(rules.len(), 7);
    assert_eq!(rules["ewaste"]["bin"], "special");
    assert_eq!(body["caps"]["glass"], 2000.0);
    assert_eq!(body["advisory"]["model"], Value::Null);
    assert_eq!(body["capture"]["hourly_cap"], 6);
}
