use std::{collections::BTreeMap, time::Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use binsight_policy::{
    award, wire::parse_labels, AverageHash, CaptureLedger, CaptureRejection, Decision,
    DecisionPath, DecisionRequest, Material, Meta, Rule, RuleTable,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::AppState;

pub const MAP_MODE_HEADER: HeaderName = HeaderName::from_static("x-map-mode");
pub const MAP_MODEL_HEADER: HeaderName = HeaderName::from_static("x-map-model");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DecisionBody {
    /// One of plastic, metal, glass, paper, cardboard, organic, ewaste, unknown.
    pub material: String,
    /// One of recycling, compost, landfill, special.
    pub bin: String,
    pub tip: String,
    pub years: f64,
    pub risk_score: f64,
}

impl From<&Decision> for DecisionBody {
    fn from(d: &Decision) -> Self {
        Self {
            material: d.material.as_str().to_string(),
            bin: d.bin.as_str().to_string(),
            tip: d.tip.clone(),
            years: d.years,
            risk_score: d.risk_score,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LabelBody {
    pub name: String,
    pub prob: f64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MetaBody {
    pub conf: Option<f64>,
    pub delta: Option<f64>,
    #[serde(rename = "recentCount")]
    pub recent_count: Option<u32>,
}

/// Shape of a `/v1/map` body. Parsing is lenient: unusable parts are
/// ignored rather than rejected.
#[derive(Debug, Deserialize, ToSchema)]
pub struct MapRequest {
    pub labels: Vec<LabelBody>,
    /// Material → partial rule (`bin`, `years`, `tip`).
    #[schema(value_type = Object)]
    pub rules: Option<Value>,
    pub meta: Option<MetaBody>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CaptureRequest {
    pub team_id: String,
    pub bin_id: String,
    /// 16 hex digit average hash of the captured frame.
    pub ahash: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub labels: Value,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub rules: Value,
    /// Required: a missing value must not read as a static frame.
    #[serde(alias = "motionDelta")]
    pub motion_delta: f64,
    #[serde(default, alias = "conf")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CaptureResponse {
    pub decision: DecisionBody,
    pub points: u32,
    pub ahash: String,
    pub mode: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub reason: String,
    pub error: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PointsRequest {
    pub years: f64,
    #[serde(default)]
    pub risk_score: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PointsResponse {
    pub points: u32,
}

fn error_response(status: StatusCode, reason: &str, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            reason: reason.to_string(),
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

async fn map_decision(state: &AppState, body: &[u8], path: &'static str) -> Response {
    let started = Instant::now();
    let request = DecisionRequest::from_slice(body);
    let outcome = state
        .engine()
        .decide(&request.labels, &request.rules, &request.meta)
        .await;
    state.record_decision(&outcome.path, outcome.decision.material);
    state.emit(
        "decision.made",
        json!({
            "decision": &outcome.decision,
            "mode": outcome.path.mode(),
            "model": outcome.path.model(),
            "labels": request.labels.len(),
        }),
    );

    let response = (
        [
            (MAP_MODE_HEADER, HeaderValue::from_static(outcome.path.mode())),
            (MAP_MODEL_HEADER, header_value(outcome.path.model())),
        ],
        Json(DecisionBody::from(&outcome.decision)),
    )
        .into_response();
    state.record_http_observation(Method::POST, path, StatusCode::OK, started);
    response
}

/// Maps vision labels to a disposal decision. Always answers 200; the
/// `x-map-mode` header tells whether the advisory or the heuristic decided.
#[utoipa::path(
    post,
    path = "/v1/map",
    tag = "core",
    request_body = MapRequest,
    responses((status = 200, description = "Disposal decision", body = DecisionBody))
)]
pub async fn map_handler(State(state): State<AppState>, body: Bytes) -> Response {
    map_decision(&state, &body, "/v1/map").await
}

pub async fn legacy_map_handler(State(state): State<AppState>, body: Bytes) -> Response {
    map_decision(&state, &body, "/api/map").await
}

/// Gates a capture through the per-bin ledger, decides and awards points.
#[utoipa::path(
    post,
    path = "/v1/capture",
    tag = "core",
    request_body = CaptureRequest,
    responses(
        (status = 200, description = "Capture accepted", body = CaptureResponse),
        (status = 400, description = "Malformed body", body = ErrorBody),
        (status = 409, description = "Duplicate capture", body = ErrorBody),
        (status = 422, description = "Static frame or malformed hash", body = ErrorBody),
        (status = 429, description = "Hourly cap reached", body = ErrorBody)
    )
)]
pub async fn capture_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();
    let path = "/v1/capture";

    let req: CaptureRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            state.record_http_observation(Method::POST, path, StatusCode::BAD_REQUEST, started);
            return error_response(StatusCode::BAD_REQUEST, "malformed_body", err);
        }
    };
    let hash: AverageHash = match req.ahash.parse() {
        Ok(hash) => hash,
        Err(err) => {
            state.record_capture_rejection("invalid_hash");
            state.record_http_observation(
                Method::POST,
                path,
                StatusCode::UNPROCESSABLE_ENTITY,
                started,
            );
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid_hash", err);
        }
    };

    let key = CaptureLedger::key(&req.team_id, &req.bin_id);
    let motion = req.motion_delta;
    let admitted = state.with_ledger(|ledger| ledger.admit(&key, hash, motion, Utc::now()));
    let recent = match admitted {
        Ok(recent) => recent,
        Err(rejection) => {
            let status = match rejection {
                CaptureRejection::Duplicate => StatusCode::CONFLICT,
                CaptureRejection::HourlyCap => StatusCode::TOO_MANY_REQUESTS,
                CaptureRejection::StaticFrame => StatusCode::UNPROCESSABLE_ENTITY,
            };
            tracing::debug!(key = %key, reason = rejection.reason(), "capture rejected");
            state.record_capture_rejection(rejection.reason());
            state.emit(
                "capture.rejected",
                json!({"key": key, "ahash": hash.to_string(), "reason": rejection.reason()}),
            );
            state.record_http_observation(Method::POST, path, status, started);
            return error_response(status, rejection.reason(), rejection);
        }
    };

    let labels = parse_labels(&req.labels);
    let rules = RuleTable::from_value(&req.rules);
    let meta = Meta {
        confidence: req.confidence.filter(|c| c.is_finite()),
        motion_delta: Some(motion),
        recent_submission_count: Some(u32::try_from(recent).unwrap_or(u32::MAX)),
    };
    let outcome = state.engine().decide(&labels, &rules, &meta).await;
    let points = award(
        outcome.decision.years,
        outcome.decision.risk_score,
        &state.engine().policy().points,
    );
    state.record_decision(&outcome.path, outcome.decision.material);
    state.emit(
        "capture.accepted",
        json!({
            "key": key,
            "ahash": hash.to_string(),
            "decision": &outcome.decision,
            "points": points,
            "mode": outcome.path.mode(),
        }),
    );

    let response = Json(CaptureResponse {
        decision: DecisionBody::from(&outcome.decision),
        points,
        ahash: hash.to_string(),
        mode: outcome.path.mode().to_string(),
        model: outcome.path.model().to_string(),
    })
    .into_response();
    state.record_http_observation(Method::POST, path, StatusCode::OK, started);
    response
}

#[utoipa::path(
    post,
    path = "/v1/points",
    tag = "core",
    request_body = PointsRequest,
    responses((status = 200, description = "Awarded points", body = PointsResponse))
)]
pub async fn points_handler(
    State(state): State<AppState>,
    Json(req): Json<PointsRequest>,
) -> Json<PointsResponse> {
    let started = Instant::now();
    let points = award(req.years, req.risk_score, &state.engine().policy().points);
    state.record_http_observation(Method::POST, "/v1/points", StatusCode::OK, started);
    Json(PointsResponse { points })
}

/// Effective policy with every material's rule fully resolved.
#[utoipa::path(
    get,
    path = "/v1/policy",
    tag = "core",
    responses((status = 200, description = "Effective policy"))
)]
pub async fn policy_handler(State(state): State<AppState>) -> Json<Value> {
    let started = Instant::now();
    let engine = state.engine();
    let policy = engine.policy();
    let rules: BTreeMap<Material, Rule> = Material::TAXONOMY
        .iter()
        .map(|m| (*m, policy.rules.resolve(*m)))
        .collect();
    let body = json!({
        "thresholds": &policy.thresholds,
        "risk": &policy.risk,
        "caps": &policy.caps,
        "floors": &policy.floors,
        "tips": &policy.tips,
        "rules": rules,
        "points": &policy.points,
        "capture": &policy.capture,
        "advisory": {
            "timeout_ms": policy.advisory.timeout_ms,
            "seed_paper": policy.advisory.seed_paper,
            "model": engine.advisory_model(),
        },
    });
    state.record_http_observation(Method::GET, "/v1/policy", StatusCode::OK, started);
    Json(body)
}

impl AppState {
    fn record_decision(&self, path: &DecisionPath, material: Material) {
        if let DecisionPath::Heuristic { reason } = path {
            if *reason != "not_configured" {
                self.record_advisory_failure(reason);
            }
        }
        self.record_decision_metric(path.mode(), material.as_str());
    }
}
