use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::sse::{self, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use td_core::config::Config;
use td_core::types::{Handoff, Issue, IssueStatus, IssueType, LogEntry, LogType, Priority};
use td_core::workflow::{EnforcementMode, Transition, TransitionContext, WorkflowEngine};
use td_store::{ActionType, IssueFilter, Store, StoreError};
use td_sync::{Event, EventLog, PullResult};

use crate::auth::{require_bearer, BearerAuth};
use crate::event_bus::EventBus;

/// Shared state for all HTTP handlers.
pub struct ApiState {
    pub store: Arc<Store>,
    pub event_log: Arc<EventLog>,
    pub bus: EventBus,
    pub project_id: String,
    pub workflow: WorkflowEngine,
    pub sse_poll: Duration,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(store: Arc<Store>, event_log: Arc<EventLog>, project_id: impl Into<String>) -> Self {
        Self {
            store,
            event_log,
            bus: EventBus::new(),
            project_id: project_id.into(),
            workflow: WorkflowEngine::new(EnforcementMode::Liberal),
            sse_poll: Duration::from_secs(2),
            start_time: std::time::Instant::now(),
        }
    }

    /// Apply server knobs from config: enforcement mode and SSE cadence.
    pub fn with_config(mut self, config: &Config) -> Self {
        let mode = match config.review.enforcement.as_str() {
            "strict" => EnforcementMode::Strict,
            "advisory" => EnforcementMode::Advisory,
            _ => EnforcementMode::Liberal,
        };
        self.workflow = WorkflowEngine::new(mode);
        self.sse_poll = Duration::from_secs(config.server.sse_poll_secs);
        self
    }
}

/// Build the router with optional bearer auth and CORS origin.
pub fn api_router(
    state: Arc<ApiState>,
    auth_token: Option<String>,
    cors_origin: Option<String>,
) -> Router {
    let cors = match cors_origin.and_then(|o| o.parse::<HeaderValue>().ok()) {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        None => CorsLayer::very_permissive(),
    };

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/issues", get(list_issues).post(create_issue))
        .route("/api/issues/{id}", get(get_issue))
        .route("/api/issues/{id}/status", post(update_issue_status))
        .route("/api/issues/{id}/logs", get(list_issue_logs).post(create_issue_log))
        .route("/api/issues/{id}/handoff", get(latest_handoff))
        .route("/api/boards", get(list_boards))
        .route("/sync/push", post(sync_push))
        .route("/sync/pull", get(sync_pull))
        .route("/events", get(events_sse))
        .layer(axum::middleware::from_fn_with_state(
            BearerAuth::new(auth_token),
            require_bearer,
        ))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub description: Option<String>,
    pub issue_type: Option<IssueType>,
    pub priority: Option<Priority>,
    pub session_id: Option<String>,
    pub minor: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: IssueStatus,
    pub transition: Option<Transition>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateLogRequest {
    pub message: String,
    pub log_type: Option<LogType>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListIssuesQuery {
    pub status: Option<String>,
    pub issue_type: Option<String>,
    pub label: Option<String>,
    pub text: Option<String>,
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: i64,
    pub limit: Option<i64>,
    pub exclude_device: Option<String>,
}

fn error_json(status: StatusCode, message: impl std::fmt::Display) -> axum::response::Response {
    (status, Json(serde_json::json!({"error": message.to_string()}))).into_response()
}

fn store_error(e: StoreError) -> axum::response::Response {
    match e {
        StoreError::NotFound { .. } => error_json(StatusCode::NOT_FOUND, e),
        StoreError::Invalid(_) => error_json(StatusCode::BAD_REQUEST, e),
        other => {
            tracing::error!(error = %other, "store failure");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ---------------------------------------------------------------------------
// Status & issues
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.status_counts().await {
        Ok(counts) => Json(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "project": state.project_id,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "issues": counts,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

async fn list_issues(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListIssuesQuery>,
) -> impl IntoResponse {
    let mut filter = IssueFilter {
        include_deleted: query.include_deleted.unwrap_or(false),
        text: query.text,
        ..Default::default()
    };
    if let Some(raw) = &query.status {
        for part in raw.split(',') {
            match IssueStatus::parse(part.trim()) {
                Some(status) => filter.statuses.push(status),
                None => return error_json(StatusCode::BAD_REQUEST, format!("unknown status: {part}")),
            }
        }
    }
    if let Some(raw) = &query.issue_type {
        for part in raw.split(',') {
            match IssueType::parse(part.trim()) {
                Some(t) => filter.types.push(t),
                None => return error_json(StatusCode::BAD_REQUEST, format!("unknown type: {part}")),
            }
        }
    }
    if let Some(label) = &query.label {
        filter.labels.push(label.clone());
    }

    match state.store.list_issues(&filter).await {
        Ok(issues) => Json(issues).into_response(),
        Err(e) => store_error(e),
    }
}

async fn create_issue(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateIssueRequest>,
) -> impl IntoResponse {
    if req.title.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "title cannot be empty");
    }
    let session = req.session_id.unwrap_or_else(|| "server".into());
    let id = match state.store.next_issue_id().await {
        Ok(id) => id,
        Err(e) => return store_error(e),
    };
    let mut issue = Issue::new(id, req.title, session.clone());
    issue.description = req.description;
    if let Some(t) = req.issue_type {
        issue.issue_type = t;
    }
    if let Some(p) = req.priority {
        issue.priority = p;
    }
    issue.minor = req.minor.unwrap_or(false);

    match state.store.create_issue_logged(&issue, &session).await {
        Ok(()) => (StatusCode::CREATED, Json(issue)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_issue(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_issue(&id).await {
        Ok(Some(issue)) => Json(issue).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("issue not found: {id}")),
        Err(e) => store_error(e),
    }
}

async fn update_issue_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> impl IntoResponse {
    let session = req.session_id.unwrap_or_else(|| "server".into());
    let issue = match state.store.get_issue(&id).await {
        Ok(Some(issue)) => issue,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, format!("issue not found: {id}")),
        Err(e) => return store_error(e),
    };

    let transition = req.transition.unwrap_or(match req.status {
        IssueStatus::InProgress => Transition::Start,
        IssueStatus::Blocked => Transition::Block,
        IssueStatus::InReview => Transition::Review,
        IssueStatus::Closed => Transition::Close,
        IssueStatus::Open => Transition::Reopen,
    });
    let ctx = TransitionContext {
        issue: &issue,
        from: issue.status,
        to: req.status,
        transition,
        session_id: &session,
        force: req.force,
    };
    let outcome = match state.workflow.check(&ctx) {
        Ok(outcome) => outcome,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
    };

    let mut updated = issue.clone();
    updated.status = outcome.to;
    match outcome.to {
        IssueStatus::Closed => updated.closed_at = Some(chrono::Utc::now()),
        IssueStatus::Open => updated.closed_at = None,
        _ => {}
    }
    let action = match transition {
        Transition::Start => ActionType::Start,
        Transition::Review => ActionType::Review,
        Transition::Approve => ActionType::Approve,
        Transition::Close => ActionType::Close,
        Transition::Reopen => ActionType::Reopen,
        Transition::Block => ActionType::Block,
        Transition::Unblock => ActionType::Unblock,
        Transition::Reject => ActionType::Reject,
    };
    match state.store.update_issue_logged(&updated, &session, action).await {
        Ok(stored) => Json(serde_json::json!({
            "issue": stored,
            "advisories": outcome.advisories,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// Logs, handoffs, boards
// ---------------------------------------------------------------------------

async fn list_issue_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_logs(Some(id.as_str())).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => store_error(e),
    }
}

async fn create_issue_log(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateLogRequest>,
) -> impl IntoResponse {
    let session = req.session_id.unwrap_or_else(|| "server".into());
    let mut entry = LogEntry::new(
        uuid::Uuid::new_v4().to_string(),
        session.clone(),
        req.message,
        req.log_type.unwrap_or(LogType::Progress),
    );
    entry.issue_id = Some(id);
    match state.store.create_log_logged(&entry, &session).await {
        Ok(()) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn latest_handoff(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.latest_handoff(&id).await {
        Ok(Some(handoff)) => Json::<Handoff>(handoff).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("no handoff for {id}")),
        Err(e) => store_error(e),
    }
}

async fn list_boards(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.list_boards().await {
        Ok(boards) => Json(boards).into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// Sync endpoints
// ---------------------------------------------------------------------------

async fn sync_push(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PushRequest>,
) -> impl IntoResponse {
    if req.events.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "no events in push");
    }
    match state.event_log.push_events(&state.project_id, req.events).await {
        Ok(result) => {
            // Wake SSE subscribers with the freshly sequenced events.
            if let Ok(page) = state
                .event_log
                .events_since(
                    &state.project_id,
                    result.last_server_seq - result.acks.len() as i64,
                    result.acks.len() as i64,
                    None,
                )
                .await
            {
                for event in page.events {
                    state.bus.publish(event);
                }
            }
            Json(result).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "push failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "push failed")
        }
    }
}

async fn sync_pull(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PullQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(500).clamp(1, 5000);
    match state
        .event_log
        .events_since(
            &state.project_id,
            query.since,
            limit,
            query.exclude_device.as_deref(),
        )
        .await
    {
        Ok(result) => Json::<PullResult>(result).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "pull failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "pull failed")
        }
    }
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// Stream new sync events. Bus notifications deliver immediately; the poll
/// interval is the fallback for events that arrived by other paths.
async fn events_sse(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let log = state.event_log.clone();
    let project = state.project_id.clone();
    let poll = state.sse_poll;
    let head = log.max_seq(&project).await.unwrap_or(0);

    let stream = futures_util::stream::unfold((head, rx), move |(mut last, rx)| {
        let log = log.clone();
        let project = project.clone();
        async move {
            loop {
                let events = tokio::select! {
                    received = rx.recv_async() => match received {
                        Ok(event) if event.server_seq > last => vec![event],
                        Ok(_) => continue,
                        Err(_) => {
                            tokio::time::sleep(poll).await;
                            Vec::new()
                        }
                    },
                    _ = tokio::time::sleep(poll) => {
                        match log.events_since(&project, last, 500, None).await {
                            Ok(page) => page.events,
                            Err(e) => {
                                tracing::debug!(error = %e, "sse poll failed");
                                Vec::new()
                            }
                        }
                    }
                };
                if events.is_empty() {
                    continue;
                }
                last = events.iter().map(|e| e.server_seq).max().unwrap_or(last);
                let data = serde_json::to_string(&events).unwrap_or_default();
                let item = sse::Event::default().event("sync").data(data);
                return Some((Ok(item), (last, rx)));
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<ApiState> {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let log = Arc::new(EventLog::open_in_memory().await.unwrap());
        Arc::new(ApiState::new(store, log, "proj"))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let app = api_router(test_state().await, None, None);
        let resp = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["project"], "proj");
        assert_eq!(json["issues"]["total"], 0);
    }

    #[tokio::test]
    async fn create_then_fetch_issue() {
        let state = test_state().await;
        let app = api_router(state.clone(), None, None);

        let create = Request::builder()
            .method("POST")
            .uri("/api/issues")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"title":"from http","session_id":"s1"}"#))
            .unwrap();
        let resp = app.clone().oneshot(create).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["id"], "td-1");

        let resp = app
            .oneshot(Request::builder().uri("/api/issues/td-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["title"], "from http");
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let state = test_state().await;
        let app = api_router(state.clone(), None, None);

        let mut issue = Issue::new("td-1", "x", "s1");
        issue.status = IssueStatus::Closed;
        state.store.create_issue_logged(&issue, "s1").await.unwrap();

        // closed -> in_review is not in the transition set.
        let req = Request::builder()
            .method("POST")
            .uri("/api/issues/td-1/status")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"status":"in_review","session_id":"s1"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_then_pull_round_trip() {
        let state = test_state().await;
        let app = api_router(state.clone(), None, None);

        let event = serde_json::json!({
            "server_seq": 0,
            "device_id": "dev-a",
            "session_id": "s1",
            "client_action_id": 1,
            "action_type": "create",
            "entity_type": "issues",
            "entity_id": "td-1",
            "payload": {"schema_version": 1, "new_data": {"id": "td-1", "title": "x"}},
            "client_timestamp": chrono::Utc::now().to_rfc3339(),
            "server_timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let push = Request::builder()
            .method("POST")
            .uri("/sync/push")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"events": [event]}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(push).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let pushed = body_json(resp).await;
        assert_eq!(pushed["acks"][0]["server_seq"], 1);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sync/pull?since=0&limit=10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let pulled = body_json(resp).await;
        assert_eq!(pulled["events"].as_array().unwrap().len(), 1);
        assert_eq!(pulled["last_server_seq"], 1);

        // Excluding the pushing device yields an empty page with the same
        // watermark.
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/sync/pull?since=0&limit=10&exclude_device=dev-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let pulled = body_json(resp).await;
        assert!(pulled["events"].as_array().unwrap().is_empty());
        assert_eq!(pulled["last_server_seq"], 1);
    }

    #[tokio::test]
    async fn empty_push_is_a_bad_request() {
        let app = api_router(test_state().await, None, None);
        let req = Request::builder()
            .method("POST")
            .uri("/sync/push")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"events": []}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
