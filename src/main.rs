mod authz;
mod config;
mod error;
mod forge;
mod health;
mod http;
mod metrics;
mod rcache;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::authz::{AuthnRegistry, PermissionProvider, ProviderRegistry};
use crate::config::{CacheBackend, Config};
use crate::health::HealthState;
use crate::http::handler::RepoPermsRequest;
use crate::metrics::MetricsRegistry;
use crate::rcache::memory::MemoryStore;
use crate::rcache::redis::{create_keydb_pool, RedisStore};
use crate::rcache::{Cache, CacheStore, GlobalPrefix, NoopStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgeperm", about = "Repository read-permission service for code hosts")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgeperm/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Resolve one permission request read from a JSON file and print the
    /// decision map.
    Check {
        #[arg(long)]
        request: PathBuf,
    },
    /// Delete cached entries under a component prefix, or under every code
    /// host's prefix when none is given.
    ClearCache {
        #[arg(long)]
        component: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ProviderRegistry,
    pub metrics: MetricsRegistry,
    pub health: HealthState,
    /// Cancelled on shutdown; every request token is a child of it.
    pub shutdown: CancellationToken,
}

/// Cache backend plus, for KeyDB, the handle that owns the pool.
struct Backend {
    store: Arc<dyn CacheStore>,
    keydb: Option<RedisStore>,
}

async fn build_backend(config: &Config) -> Result<Backend> {
    match config.cache.backend {
        CacheBackend::Keydb => {
            let keydb_config = config
                .cache
                .keydb
                .as_ref()
                .context("cache.keydb is required for the keydb backend")?;
            let store = RedisStore::new(create_keydb_pool(keydb_config).await?);
            Ok(Backend {
                store: Arc::new(store.clone()),
                keydb: Some(store),
            })
        }
        CacheBackend::Memory => {
            tracing::info!("using in-process cache");
            Ok(Backend {
                store: Arc::new(MemoryStore::new()),
                keydb: None,
            })
        }
        CacheBackend::Disabled => {
            tracing::warn!("permission cache disabled; every decision goes to the code host");
            Ok(Backend {
                store: Arc::new(NoopStore),
                keydb: None,
            })
        }
    }
}

fn build_registry(
    config: &Config,
    store: &Arc<dyn CacheStore>,
    prefix: &GlobalPrefix,
    metrics: &MetricsRegistry,
) -> Result<ProviderRegistry> {
    let authn = Arc::new(AuthnRegistry::new(config.auth_providers.iter().cloned()));
    if authn.is_empty() {
        tracing::debug!("no authentication providers configured; only native usernames resolve");
    } else {
        tracing::info!(count = authn.len(), "authentication providers registered");
    }

    let mut providers = Vec::with_capacity(config.code_hosts.len());
    for host in &config.code_hosts {
        let service_id = host.service_id();
        let client = forge::build_client(host)
            .with_context(|| format!("failed to build client for {service_id}"))?;
        let cache = Cache::new(Arc::clone(store), prefix, &format!("authz:{service_id}"));

        let provider = PermissionProvider::builder(client, Arc::clone(&authn))
            .cache(cache)
            .ttl(host.ttl())
            .identity_mode(host.identity_mode()?)
            .require_identity(host.authz.require_identity)
            .max_concurrency(host.authz.max_concurrency)
            .bulk_list_threshold(host.authz.bulk_list_threshold)
            .metrics(Arc::clone(&metrics.metrics))
            .build();

        tracing::info!(
            %service_id,
            service_type = host.kind.service_type(),
            ttl_secs = host.authz.ttl_secs,
            "permission provider initialised"
        );
        providers.push(Arc::new(provider));
    }

    ProviderRegistry::new(providers)
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .http
        .listen
        .parse()
        .context("invalid http.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    let shutdown = state.shutdown.clone();
    let app = http::handler::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

async fn run_check(state: &AppState, request: &Path) -> Result<()> {
    let raw = tokio::fs::read(request)
        .await
        .with_context(|| format!("failed to read request file: {}", request.display()))?;
    let request: RepoPermsRequest =
        serde_json::from_slice(&raw).context("failed to parse request file")?;

    let timeout = std::time::Duration::from_secs(state.config.http.request_timeout_secs);
    let response = http::handler::resolve_with_deadline(
        &state.registry,
        &request,
        timeout,
        &state.shutdown,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_clear_cache(
    state: &AppState,
    store: &Arc<dyn CacheStore>,
    prefix: &GlobalPrefix,
    component: Option<&str>,
) -> Result<()> {
    let removed = match component {
        Some(component) => {
            let cache = Cache::new(Arc::clone(store), prefix, component);
            tracing::info!(namespace = cache.namespace(), "clearing cache namespace");
            cache.clear_all().await?
        }
        None => {
            let mut total = 0;
            for provider in state.registry.providers() {
                total += provider.clear_cache().await?;
            }
            total
        }
    };
    tracing::info!(removed, component, "cache cleared");
    println!("{removed}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config.display(), "starting forgeperm");

    // ---- Cache ----
    let backend = build_backend(&config).await?;
    let prefix = GlobalPrefix::resolve(config.cache.deployment_id.as_deref());
    tracing::info!(prefix = prefix.as_str(), "cache key prefix resolved");

    // ---- Metrics + providers ----
    let metrics = MetricsRegistry::new();
    let registry = build_registry(&config, &backend.store, &prefix, &metrics)?;

    // ---- Health ----
    let hosts = config
        .code_hosts
        .iter()
        .map(|h| Ok((h.service_id(), h.api_url()?)))
        .collect::<Result<Vec<_>>>()?;
    let health = HealthState::new(backend.keydb.clone(), hosts)?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        registry,
        metrics,
        health,
        shutdown: CancellationToken::new(),
    });

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_http_server(Arc::clone(&state)).await,
        Command::Check { request } => run_check(&state, &request).await,
        Command::ClearCache { component } => {
            run_clear_cache(&state, &backend.store, &prefix, component.as_deref()).await
        }
    };

    // ---- Teardown ----
    state.shutdown.cancel();
    if let Some(keydb) = &backend.keydb {
        if let Err(e) = keydb.shutdown().await {
            tracing::warn!(error = %e, "KeyDB shutdown failed");
        }
    }

    tracing::info!("forgeperm shut down cleanly");
    result
}
