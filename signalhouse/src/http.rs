//! The thin HTTP surface: ingest, OTLP receivers, the query lifecycle and
//! SSE streaming. Handlers translate between the wire and the core crates;
//! no engine logic lives here.

use crate::server::Components;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event as SseFrame, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use data_types::{IssueStatus, QueryRequest, RequestContext};
use futures::StreamExt;
use ingester::IssueRepository;
use observability_deps::tracing::debug;
use querier::{EventReader, PartitionSelector};
use query_lifecycle::QueryLifecycle;
use router::{ApiError, ApiKeyResolver, ErrorCode, Intake, ProjectAuth};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    intake: Arc<Intake>,
    resolver: Arc<dyn ApiKeyResolver>,
    lifecycle: Arc<QueryLifecycle>,
    issues: Arc<dyn IssueRepository>,
    reader: Arc<EventReader>,
    sse: query_lifecycle::SseConfig,
}

impl AppState {
    /// State over the wired components.
    pub fn new(components: &Components) -> Self {
        Self {
            intake: Arc::clone(&components.intake),
            resolver: Arc::clone(&components.resolver),
            lifecycle: Arc::clone(&components.lifecycle),
            issues: Arc::clone(&components.issues),
            reader: Arc::clone(&components.reader),
            sse: components.sse,
        }
    }
}

/// The full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_events))
        .route("/events/batch", post(ingest_batch))
        .route("/v1/traces", post(otlp_traces))
        .route("/v1/logs", post(otlp_logs))
        .route("/v1/metrics", post(otlp_metrics))
        .route("/queries", post(submit_query))
        .route("/queries/:query_id/status", get(query_status))
        .route("/queries/:query_id/cancel", post(cancel_query))
        .route("/queries/:query_id/stream", get(stream_query))
        .route("/projects/:project_id/issues", get(list_issues))
        .route(
            "/projects/:project_id/issues/:fingerprint",
            get(get_issue).patch(set_issue_status),
        )
        .route(
            "/projects/:project_id/issues/:fingerprint/events",
            get(issue_events),
        )
        .with_state(state)
}

/// An error envelope plus its HTTP status.
struct Failure(StatusCode, ApiError);

impl Failure {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self(status, ApiError::new(code, message))
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<router::Error> for Failure {
    fn from(error: router::Error) -> Self {
        match error {
            router::Error::Validation { ref errors } => Self(
                StatusCode::BAD_REQUEST,
                ApiError::with_details(
                    ErrorCode::BadRequest,
                    error.to_string(),
                    serde_json::to_value(errors).unwrap_or(Value::Null),
                ),
            ),
            router::Error::InvalidBody
            | router::Error::EmptyBatch
            | router::Error::BatchTooLarge { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::BadRequest,
                error.to_string(),
            ),
            router::Error::Enqueue { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Error,
                error.to_string(),
            ),
        }
    }
}

/// Resolves the ingest API key from `x-api-key` or a bearer token.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ProjectAuth, Failure> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .ok_or_else(|| {
            Failure::new(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "missing API key",
            )
        })?;

    state.resolver.resolve(key).ok_or_else(|| {
        Failure::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthenticationFailed,
            "unknown API key",
        )
    })
}

/// The caller context of the query surface, established by the outer auth
/// layer and forwarded in headers.
fn request_context(headers: &HeaderMap) -> Result<RequestContext, Failure> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    match (get("x-user-id"), get("x-organization-id")) {
        (Some(user_id), Some(organization_id)) => Ok(RequestContext {
            user_id,
            organization_id,
        }),
        _ => Err(Failure::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized,
            "missing caller context",
        )),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ingest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, Failure> {
    let auth = authenticate(&state, &headers)?;
    let accepted = state.intake.ingest(&auth, body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": format!("{accepted} event(s) accepted for processing"),
        })),
    ))
}

async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, Failure> {
    let auth = authenticate(&state, &headers)?;
    let outcome = state.intake.ingest_batch(&auth, body).await?;
    let status = if outcome.errors.is_empty() {
        "accepted"
    } else {
        "partial"
    };
    let mut body = json!({
        "status": status,
        "accepted": outcome.accepted,
        "total": outcome.total,
    });
    if !outcome.errors.is_empty() {
        body["errors"] = serde_json::to_value(&outcome.errors).unwrap_or(Value::Null);
    }
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn otlp_traces(
    state: State<AppState>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Result<impl IntoResponse, Failure> {
    otlp_ingest(state, headers, body, router::convert_traces).await
}

async fn otlp_logs(
    state: State<AppState>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Result<impl IntoResponse, Failure> {
    otlp_ingest(state, headers, body, router::convert_logs).await
}

async fn otlp_metrics(
    state: State<AppState>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Result<impl IntoResponse, Failure> {
    otlp_ingest(state, headers, body, router::convert_metrics).await
}

async fn otlp_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
    convert: fn(&ProjectAuth, &Value) -> Vec<serde_json::Map<String, Value>>,
) -> Result<impl IntoResponse, Failure> {
    let auth = authenticate(&state, &headers)?;
    let payloads = convert(&auth, &body);
    let accepted = if payloads.is_empty() {
        0
    } else {
        let events: Vec<Value> = payloads.into_iter().map(Value::Object).collect();
        state
            .intake
            .ingest(&auth, json!({ "events": events }))
            .await?
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "accepted": accepted })),
    ))
}

async fn submit_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, Failure> {
    let context = request_context(&headers)?;
    let submitted = state
        .lifecycle
        .submit(request, context)
        .await
        .map_err(|e| {
            Failure::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Error, e.to_string())
        })?;
    let query_id = submitted.query_id;
    debug!(%query_id, "query submitted");
    Ok(Json(json!({
        "queryId": query_id,
        "streamUrl": format!("/queries/{query_id}/stream"),
        "cancelUrl": format!("/queries/{query_id}/cancel"),
        "statusUrl": format!("/queries/{query_id}/status"),
    })))
}

async fn query_status(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Result<Json<Value>, Failure> {
    let store = state.lifecycle.store();
    let query = store.get_query_state(&query_id).map_err(|_| {
        Failure::new(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("query '{query_id}' not found"),
        )
    })?;
    Ok(Json(json!({
        "status": query.status,
        "progress": query.progress,
        "error": query.error,
        "hasResult": query.result.is_some(),
    })))
}

async fn cancel_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Result<Json<Value>, Failure> {
    use query_lifecycle::StoreError;

    let store = state.lifecycle.store();
    match store.request_cancellation(&query_id) {
        Ok(_) => Ok(Json(json!({
            "success": true,
            "message": "cancellation requested",
        }))),
        Err(StoreError::NotFound { .. }) => Err(Failure::new(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("query '{query_id}' not found"),
        )),
        Err(StoreError::AlreadyTerminal { .. }) => Err(Failure::new(
            StatusCode::CONFLICT,
            ErrorCode::BadRequest,
            "query is already terminal",
        )),
        Err(e) => Err(Failure::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Error,
            e.to_string(),
        )),
    }
}

async fn stream_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> impl IntoResponse {
    let stream = query_lifecycle::stream_query(
        Arc::clone(state.lifecycle.store()),
        query_id,
        state.sse,
    )
    .map(|event| {
        SseFrame::default()
            .event(event.name())
            .json_data(event.payload())
    });

    // proxies must not buffer the stream; every frame flushes immediately
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
}

#[derive(Debug, Deserialize)]
struct IssueQuery {
    #[serde(default = "default_issue_limit")]
    limit: usize,
}

fn default_issue_limit() -> usize {
    50
}

async fn list_issues(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<IssueQuery>,
) -> Result<Json<Value>, Failure> {
    let issues = state
        .issues
        .list_for_project(&project_id, query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "issues": issues })))
}

async fn get_issue(
    State(state): State<AppState>,
    Path((project_id, fingerprint)): Path<(String, String)>,
) -> Result<Json<Value>, Failure> {
    let issue = state
        .issues
        .get(&project_id, &fingerprint)
        .await
        .map_err(internal)?
        .ok_or_else(|| issue_not_found(&fingerprint))?;
    Ok(Json(serde_json::to_value(issue).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: IssueStatus,
}

async fn set_issue_status(
    State(state): State<AppState>,
    Path((project_id, fingerprint)): Path<(String, String)>,
    Json(change): Json<StatusChange>,
) -> Result<Json<Value>, Failure> {
    let issue = state
        .issues
        .set_status(&project_id, &fingerprint, change.status)
        .await
        .map_err(internal)?
        .ok_or_else(|| issue_not_found(&fingerprint))?;
    Ok(Json(serde_json::to_value(issue).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct IssueEventsQuery {
    #[serde(default = "default_issue_limit")]
    limit: usize,
    #[serde(default)]
    from: Option<i64>,
    #[serde(default)]
    to: Option<i64>,
}

async fn issue_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, fingerprint)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<IssueEventsQuery>,
) -> Result<Json<Value>, Failure> {
    let context = request_context(&headers)?;
    let selector = PartitionSelector {
        organization_id: Some(context.organization_id),
        project_id: Some(project_id),
        event_type: None,
        from_millis: query.from,
        to_millis: query.to,
    };
    let events = state
        .reader
        .events_by_fingerprint(&fingerprint, selector, query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "events": events })))
}

fn internal(error: impl std::fmt::Display) -> Failure {
    Failure::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Error,
        error.to_string(),
    )
}

fn issue_not_found(fingerprint: &str) -> Failure {
    Failure::new(
        StatusCode::NOT_FOUND,
        ErrorCode::NotFound,
        format!("no issue with fingerprint '{fingerprint}'"),
    )
}
