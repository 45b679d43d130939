use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::interfaces::ClientLike;
use futures::future::join_all;
use serde::Serialize;
use url::Url;

use crate::rcache::redis::RedisStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Absent when the cache backend is not KeyDB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
    pub code_hosts: Vec<HostCheck>,
}

#[derive(Debug, Serialize)]
pub struct HostCheck {
    pub service_id: String,
    #[serde(flatten)]
    pub result: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// What the health check covers: the shared cache and each code host API.
#[derive(Clone)]
pub struct HealthState {
    pub keydb: Option<RedisStore>,
    /// `(service_id, api_url)` per configured code host.
    pub code_hosts: Vec<(String, Url)>,
    pub http_client: reqwest::Client,
}

impl HealthState {
    pub fn new(keydb: Option<RedisStore>, code_hosts: Vec<(String, Url)>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("forgeperm/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            keydb,
            code_hosts,
            http_client,
        })
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(store: &RedisStore) -> CheckResult {
    match store.pool().ping::<String>(None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

/// Any answer below 500 means the API is up; unauthenticated requests
/// commonly get 401.
async fn check_code_host(client: &reqwest::Client, api_url: &Url) -> CheckResult {
    match client.head(api_url.clone()).send().await {
        Ok(resp) if !resp.status().is_server_error() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {api_url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {api_url} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Without the cache every request goes remote, which the code hosts'
    // rate limits will not sustain.
    if checks.keydb.as_ref().is_some_and(|c| !c.ok) {
        return HealthStatus::Unhealthy;
    }
    if checks.code_hosts.iter().all(|h| h.result.ok) {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

pub async fn run_checks(state: &HealthState) -> HealthResponse {
    let keydb = async {
        match &state.keydb {
            Some(store) => Some(check_keydb(store).await),
            None => None,
        }
    };
    let hosts = join_all(state.code_hosts.iter().map(|(service_id, api_url)| async move {
        HostCheck {
            service_id: service_id.clone(),
            result: check_code_host(&state.http_client, api_url).await,
        }
    }));
    let (keydb, code_hosts) = tokio::join!(keydb, hosts);

    let checks = HealthChecks { keydb, code_hosts };
    let status = aggregate_status(&checks);
    HealthResponse { status, checks }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let body = run_checks(&state).await;
    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}
