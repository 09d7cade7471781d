//! HTTP API: alert lifecycle, rules, ingest, health and Prometheus metrics

use alert_engine::{
    rules::AlertRule, AlertEngine, AlertStatus, ComponentStatus, EngineError, Labels, MetricSample,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AlertEngine>,
}

impl AppState {
    pub fn new(engine: Arc<AlertEngine>) -> Self {
        Self { engine }
    }
}

/// Error body returned by every handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, what)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::AlertNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. } | EngineError::AlertNotFiring(_) => {
                StatusCode::CONFLICT
            }
            EngineError::InvalidRuleDefinition { .. } => StatusCode::BAD_REQUEST,
            EngineError::AiAnalysisUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.engine.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.engine.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SampleInput {
    pub metric: String,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
    /// Defaults to the time of receipt
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub samples: Vec<SampleInput>,
}

async fn ingest_samples(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let samples = request
        .samples
        .into_iter()
        .map(|s| MetricSample {
            metric: s.metric,
            labels: s.labels,
            value: s.value,
            timestamp: s.timestamp.unwrap_or(now),
        })
        .collect();

    (StatusCode::ACCEPTED, Json(state.engine.ingest(samples)))
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub status: Option<String>,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AlertStatus>)
        .transpose()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    let mut alerts = state.engine.alerts(status);
    alerts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(alerts))
}

async fn aggregated_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.aggregated(Utc::now()))
}

async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .alert(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("alert {} not found", id)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActorRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

impl ActorRequest {
    fn actor(&self) -> &str {
        self.actor
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or("api")
    }
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let alert = state.engine.acknowledge(&id, request.actor()).await?;
    Ok(Json(alert))
}

async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let alert = state.engine.resolve(&id, request.actor()).await?;
    Ok(Json(alert))
}

async fn get_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .analysis(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no analysis for alert {}", id)))
}

async fn request_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let analysis = state.engine.request_analysis(&id).await?;
    Ok(Json(analysis))
}

async fn alert_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.engine.alert(&id).is_none() {
        return Err(ApiError::not_found(format!("alert {} not found", id)));
    }
    Ok(Json(state.engine.deliveries(Some(&id))))
}

async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.registry().snapshot();
    let mut rules: Vec<AlertRule> = snapshot.iter().map(|r| r.as_ref().clone()).collect();
    rules.sort_by(|a, b| a.id.cmp(&b.id));
    Json(rules)
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .registry()
        .get(&id)
        .map(|r| Json(r.as_ref().clone()))
        .ok_or_else(|| ApiError::not_found(format!("rule {} not found", id)))
}

async fn put_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(rule): Json<AlertRule>,
) -> ApiResult<impl IntoResponse> {
    if rule.id != id {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("rule id {} does not match path {}", rule.id, id),
        ));
    }

    let created = state.engine.upsert_rule(rule.clone())?;
    info!(rule_id = %id, created = created, "Rule stored via API");
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(rule)))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.remove_rule(&id) {
        info!(rule_id = %id, "Rule removed via API");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("rule {} not found", id)))
    }
}

/// Lifecycle events as server-sent events; lagging subscribers skip ahead
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.engine.subscribe()).filter_map(|item| {
        let event = item.ok()?;
        Event::default()
            .event(event.kind.to_string())
            .json_data(&event)
            .ok()
            .map(Ok::<Event, Infallible>)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/samples", post(ingest_samples))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/alerts/aggregated", get(aggregated_alerts))
        .route("/api/v1/alerts/:id", get(get_alert))
        .route("/api/v1/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .route(
            "/api/v1/alerts/:id/analysis",
            get(get_analysis).post(request_analysis),
        )
        .route("/api/v1/alerts/:id/deliveries", get(alert_deliveries))
        .route("/api/v1/rules", get(list_rules))
        .route(
            "/api/v1/rules/:id",
            get(get_rule).put(put_rule).delete(delete_rule),
        )
        .route("/api/v1/events", get(events))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` fires and connections drain
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
