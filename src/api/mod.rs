//! Subscriber agent HTTP API.
//!
//! Every route requires `Authorization: Bearer <token>`:
//! - `POST /`: execute the command subscribed for the event's `(username, event_type)`
//! - `POST /subscribe`: add or replace a subscription
//! - `POST /edit`: replace the command of an existing subscription
//! - `POST /unsubscribe`: remove a subscription
//! - `GET /list-subscriptions?username=&event_type=`: list subscriptions
//! - `GET /health`: liveness

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::event::{EVENT_TYPE_FIELD, USERNAME_FIELD};
use crate::executor::{CommandExecutor, ExecutorError, SubscriptionError, SubscriptionService};
use crate::registry::Subscription;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AgentState {
    executor: Arc<CommandExecutor>,
    subscriptions: Arc<SubscriptionService>,
    token: Arc<str>,
}

impl AgentState {
    pub fn new(
        executor: Arc<CommandExecutor>,
        subscriptions: Arc<SubscriptionService>,
        token: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            executor,
            subscriptions,
            token: token.into(),
        }
    }
}

/// Start the agent on `bind` and serve until `shutdown` resolves.
pub async fn serve(
    state: AgentState,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    serve_on(state, listener, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on(
    state: AgentState,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Agent API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/", post(execute))
        .route("/subscribe", post(subscribe))
        .route("/edit", post(edit))
        .route("/unsubscribe", post(unsubscribe))
        .route("/list-subscriptions", get(list_subscriptions))
        .route("/health", get(health))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AgentState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented != Some(&*state.token) {
        warn!(path = %request.uri().path(), "Rejected request without a valid token");
        return ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(request).await
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<StatusBody> {
    Json(StatusBody::new("ok"))
}

async fn execute(
    State(state): State<AgentState>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "Request body must be a JSON object",
            ))
        }
    };

    let (Some(event_type), Some(username)) = (
        non_empty(&payload, EVENT_TYPE_FIELD),
        non_empty(&payload, USERNAME_FIELD),
    ) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "event_type and username are required",
        ));
    };

    let execution = state
        .executor
        .handle(event_type, username, &payload)
        .await
        .map_err(|e| match e {
            ExecutorError::TemplateNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, e.to_string())
            }
            // Not retryable: redelivering the event would fail the same way.
            ExecutorError::Spawn(_) => {
                error!(error = %e, "Command execution failed");
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
        })?;

    let output = execution.output;
    Ok(Json(ExecuteResponse {
        status: "Command executed",
        pid: execution.pid,
        exit_code: output.as_ref().and_then(|o| o.exit_code),
        stdout: output.as_ref().map(|o| o.stdout.clone()),
        stderr: output.map(|o| o.stderr),
    }))
}

async fn subscribe(
    State(state): State<AgentState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<StatusBody>, ApiError> {
    state
        .subscriptions
        .subscribe(&request.username, &request.event_type, &request.command)
        .await?;
    Ok(Json(StatusBody::new("Subscription added/updated")))
}

async fn edit(
    State(state): State<AgentState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<StatusBody>, ApiError> {
    state
        .subscriptions
        .edit(&request.username, &request.event_type, &request.command)
        .await?;
    Ok(Json(StatusBody::new("Subscription updated")))
}

async fn unsubscribe(
    State(state): State<AgentState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<StatusBody>, ApiError> {
    state
        .subscriptions
        .unsubscribe(&request.username, &request.event_type)
        .await?;
    Ok(Json(StatusBody::new("Subscription removed")))
}

async fn list_subscriptions(
    State(state): State<AgentState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let username = query.username.unwrap_or_default();
    let event_type = query.event_type.filter(|e| !e.is_empty());
    let subscriptions = state
        .subscriptions
        .list_subscriptions(&username, event_type.as_deref())
        .await?;

    info!(username = %username, count = subscriptions.len(), "Listed subscriptions");
    Ok(Json(ListResponse { subscriptions }))
}

fn non_empty<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Body of the subscription management routes.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionRequest {
    pub username: String,
    pub event_type: String,
    /// Ignored by `/unsubscribe`.
    pub command: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    username: Option<String>,
    event_type: Option<String>,
}

/// `{"status": ...}` acknowledgement.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

impl StatusBody {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

/// Body of `GET /list-subscriptions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub subscriptions: Vec<Subscription>,
}

/// `{"error": ...}` with a status code.
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
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        let status = match &e {
            SubscriptionError::Invalid(_) => StatusCode::BAD_REQUEST,
            SubscriptionError::NotFound { .. } | SubscriptionError::UnknownSubscriber(_) => {
                StatusCode::NOT_FOUND
            }
            SubscriptionError::Registry(_) => {
                error!(error = %e, "Subscription store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
