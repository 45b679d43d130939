//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /v1/repo-perms` - Read permissions of a user for a set of repositories
//! - `POST /v1/invalidate` - Drop the cached visibility of one repository
//! - `GET  /healthz`       - Health check
//! - `GET  /metrics`       - Prometheus metrics

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::authz::registry::ProviderRegistry;
use crate::authz::types::{ExternalAccount, Repo, RepoPerms, User};
use crate::error::AuthzError;
use crate::metrics::EndpointLabels;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/repo-perms", post(handle_repo_perms))
        .route("/v1/invalidate", post(handle_invalidate))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepoPermsRequest {
    /// Absent for anonymous callers.
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub accounts: Vec<ExternalAccount>,
    pub repos: Vec<Repo>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RepoPermsResponse {
    /// Repositories missing here must be treated as unreadable.
    pub perms: RepoPerms,
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    service_id: String,
    repo_id: u64,
}

// ---------------------------------------------------------------------------
// Resolution with a deadline
// ---------------------------------------------------------------------------

/// Run `request` against every code host.  When `timeout` passes (or
/// `parent` is cancelled) resolution stops and the decisions made so far
/// are returned.
pub async fn resolve_with_deadline(
    registry: &ProviderRegistry,
    request: &RepoPermsRequest,
    timeout: Duration,
    parent: &CancellationToken,
) -> Result<RepoPermsResponse, AuthzError> {
    let cancel = parent.child_token();
    let deadline = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        }
    });

    let repos: HashSet<Repo> = request.repos.iter().cloned().collect();
    let result = registry
        .repo_perms(request.user.as_ref(), &request.accounts, &repos, &cancel)
        .await;
    deadline.abort();

    if cancel.is_cancelled() {
        warn!(timeout_secs = timeout.as_secs(), "permission request cut short");
    }
    Ok(RepoPermsResponse { perms: result? })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn count(state: &AppState, endpoint: &str) {
    state
        .metrics
        .metrics
        .http_requests
        .get_or_create(&EndpointLabels {
            endpoint: endpoint.to_owned(),
        })
        .inc();
}

/// `POST /v1/repo-perms`
#[instrument(skip_all, fields(user_id = request.user.as_ref().map(|u| u.id), repos = request.repos.len()))]
async fn handle_repo_perms(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RepoPermsRequest>,
) -> Result<Json<RepoPermsResponse>, AppError> {
    count(&state, "repo-perms");
    let timeout = Duration::from_secs(state.config.http.request_timeout_secs);
    let response =
        resolve_with_deadline(&state.registry, &request, timeout, &state.shutdown).await?;
    Ok(Json(response))
}

/// `POST /v1/invalidate`
#[instrument(skip_all, fields(service_id = %request.service_id, repo_id = request.repo_id))]
async fn handle_invalidate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvalidateRequest>,
) -> Result<StatusCode, AppError> {
    count(&state, "invalidate");
    let provider = state
        .registry
        .provider_for_service(&request.service_id)
        .ok_or_else(|| AppError::NotFound(format!("unknown code host {}", request.service_id)))?;
    provider
        .invalidate_repo(request.repo_id)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    info!("repository invalidated on operator request");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(State(state.health.clone())).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {e}")))?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request data or code host configuration is wrong; retrying will
    /// not help.
    Configuration(AuthzError),
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Configuration(err) => {
                warn!(error = %err, "permission request rejected");
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(err) => {
                error!(error = format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        if err.is_configuration() {
            AppError::Configuration(err)
        } else {
            AppError::Internal(err.into())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
