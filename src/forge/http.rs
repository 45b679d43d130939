//! HTTP plumbing shared by every code host client.
//!
//! Each client owns one [`ApiClient`]: a `reqwest::Client` with a request
//! timeout, a semaphore capping concurrent requests to the host, and the
//! host's rate-limit state as reported in its response headers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

/// Remaining-call budget reported by the host, updated after every response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl RateLimitState {
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Accepts `X-RateLimit-*` (GitHub) and `RateLimit-*` (GitLab, IETF
    /// draft) header names.  Hosts that send neither leave the state alone.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let read = |primary: &str, fallback: &str| {
            headers
                .get(primary)
                .or_else(|| headers.get(fallback))
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };

        if let Some(r) = read("X-RateLimit-Remaining", "RateLimit-Remaining") {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = read("X-RateLimit-Reset", "RateLimit-Reset") {
            self.reset_at.store(r, Ordering::Relaxed);
        }
    }

    /// How long to hold off before the next call, if the remaining budget is
    /// under `buffer` and the window has not reset yet.
    pub fn throttle_for(&self, buffer: u32) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining == u64::MAX || remaining >= u64::from(buffer) {
            return None;
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let reset = self.reset_at();
        (reset > now).then(|| Duration::from_secs(reset - now))
    }
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

/// A decoded JSON response plus its headers (for pagination).
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub body: T,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    permits: Arc<Semaphore>,
    rate_limit: RateLimitState,
    rate_limit_buffer: u32,
}

impl ApiClient {
    pub fn new(
        base: Url,
        request_timeout: Duration,
        max_connections: usize,
        rate_limit_buffer: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("forgeperm/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_connections)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            base,
            permits: Arc::new(Semaphore::new(max_connections)),
            rate_limit: RateLimitState::default(),
            rate_limit_buffer,
        })
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// Append path segments (escaped) to the API root.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("API URL {} cannot be a base", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn get(&self, url: Url) -> RequestBuilder {
        self.http.get(url)
    }

    /// Send a request and decode a JSON body.  `404` is `Ok(None)`; any other
    /// non-success status is an error.
    ///
    /// A connection permit is held from before the request is sent until the
    /// body has been read, and is released on every return path.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<ApiResponse<T>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("code host connection pool closed")?;

        if let Some(wait) = self.rate_limit.throttle_for(self.rate_limit_buffer) {
            info!(
                remaining = self.rate_limit.remaining(),
                reset_in_secs = wait.as_secs(),
                "self-throttling: rate limit approaching"
            );
            tokio::time::sleep(wait).await;
        }

        let resp = request.send().await.context("code host request failed")?;
        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %resp.url(), "code host returned 404");
            return Ok(None);
        }
        if !status.is_success() {
            bail!("GET {} returned {status}", resp.url());
        }

        let headers = resp.headers().clone();
        let url = resp.url().clone();
        let body = resp
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode response from {url}"))?;
        Ok(Some(ApiResponse { body, headers }))
    }
}
