//! KeyDB / Redis backed [`CacheStore`].
//!
//! The connection pool is built once at startup by [`create_keydb_pool`],
//! owned by `main`, and shut down with [`RedisStore::shutdown`].  Each
//! command borrows a pooled connection for its own duration only, so a
//! failing command never holds on to one.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration};
use tracing::{debug, trace};

use super::{CacheStore, MAX_TTL};
use crate::config::KeyDbConfig;
use crate::error::CacheError;

/// Deletes every key matching `ARGV[1]`, in batches so `unpack` stays under
/// Lua's argument limit.
const CLEAR_SCRIPT: &str = r#"
local keys = redis.call('KEYS', ARGV[1])
local n = 0
for i = 1, #keys, 500 do
    n = n + redis.call('DEL', unpack(keys, i, math.min(i + 499, #keys)))
end
return n
"#;

// ---------------------------------------------------------------------------
// Pool construction
// ---------------------------------------------------------------------------

/// Create and verify (PING) a KeyDB connection pool.
///
/// The auth token is read from the environment variable named in
/// `config.auth_token_env`.  TLS uses fred's rustls connector.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };
    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let command_timeout = Duration::from_millis(config.command_timeout_ms);
    let mut builder = Builder::from_config(fred_config);
    builder.with_performance_config(|perf| {
        perf.default_command_timeout = command_timeout;
    });
    builder.with_connection_config(|conn| {
        conn.connection_timeout = command_timeout;
    });
    // Exponential reconnect: unlimited attempts, 100ms base, 30s cap.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host,
        port,
        tls = config.tls,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );
    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

/// Escape Redis glob metacharacters so a literal prefix can be used in a
/// `KEYS` pattern.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `SET EX` takes whole seconds; round up so an entry never expires early.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl
        .as_secs()
        .saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.clamp(1, MAX_TTL.as_secs()) as i64
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close every pooled connection.  Called once on shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.quit().await.context("KeyDB QUIT failed")?;
        tracing::info!("KeyDB pool closed");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let val: Option<Vec<u8>> = self.pool.get(key).await.map_err(CacheError::transport)?;
        trace!(key, hit = val.is_some(), "cache get");
        Ok(val)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let secs = ttl_secs(ttl);
        let _: () = self
            .pool
            .set(
                key,
                Bytes::copy_from_slice(value),
                Some(Expiration::EX(secs)),
                None,
                false,
            )
            .await
            .map_err(CacheError::transport)?;
        trace!(key, ttl_secs = secs, "cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _: i64 = self.pool.del(key).await.map_err(CacheError::transport)?;
        trace!(key, "cache delete");
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let deleted: i64 = self
            .pool
            .eval(CLEAR_SCRIPT, Vec::<String>::new(), vec![pattern.clone()])
            .await
            .map_err(CacheError::transport)?;
        debug!(%pattern, deleted, "cache prefix cleared");
        Ok(deleted.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("keydb.local:6380").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("keydb.local").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_strips_path() {
        let (host, port) = parse_host_port("keydb.local:6380/0").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_bad_port() {
        assert!(parse_host_port("keydb.local:redis").is_err());
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_secs(Duration::from_secs(10)), 10);
        assert_eq!(ttl_secs(Duration::from_millis(10_001)), 11);
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
    }

    #[test]
    fn huge_ttl_stays_a_positive_expiry() {
        assert_eq!(ttl_secs(Duration::MAX), MAX_TTL.as_secs() as i64);
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("host:v1:authz"), "host:v1:authz");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }
}
