use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::authz::registry::AuthnProvider;
use crate::authz::types::{
    CodeHost, SERVICE_TYPE_BITBUCKET_SERVER, SERVICE_TYPE_GITHUB, SERVICE_TYPE_GITLAB,
};
use crate::forge::IdentityMode;
use crate::rcache::MAX_TTL;

// ---------------------------------------------------------------------------
// Code host kind
// ---------------------------------------------------------------------------

/// Which code host family a connection talks to.
///
/// This controls API URL derivation, response parsing and how private
/// repository access is established:
///
/// | Variant            | Private access check                         | Bulk listing |
/// |--------------------|----------------------------------------------|--------------|
/// | `github`           | collaborator permission (admin token)        | no           |
/// | `gitlab`           | project fetch with `Sudo` (admin token)      | yes          |
/// | `bitbucket-server` | repository / project user grants             | no           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeHostKind {
    Github,
    Gitlab,
    BitbucketServer,
}

impl CodeHostKind {
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::Github => SERVICE_TYPE_GITHUB,
            Self::Gitlab => SERVICE_TYPE_GITLAB,
            Self::BitbucketServer => SERVICE_TYPE_BITBUCKET_SERVER,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Authentication providers users link external accounts through.
    #[serde(default)]
    pub auth_providers: Vec<AuthnProvider>,
    pub code_hosts: Vec<CodeHostConfig>,
}

// ---------------------------------------------------------------------------
// HTTP listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline for resolving one permission request.  Repositories still
    /// undecided when it passes are left out of the answer.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Shared KeyDB / Redis.
    #[default]
    Keydb,
    /// In-process; only for single-replica deployments.
    Memory,
    /// Every lookup goes to the code host.
    Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// First component of every cache key.  Falls back to
    /// `FORGEPERM_DEPLOYMENT_ID`, then the hostname.
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-command timeout; also used as the connect timeout.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_command_timeout_ms() -> u64 {
    2000
}

// ---------------------------------------------------------------------------
// Code hosts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CodeHostConfig {
    pub kind: CodeHostKind,
    /// Web URL of the instance (e.g. `https://gitlab.corp.example.com`).
    pub url: Url,
    /// API root.  Derived from `url` when absent.
    #[serde(default)]
    pub api_url: Option<Url>,
    /// Name of the environment variable that holds the admin token.
    ///
    /// GitHub needs a token that can read collaborator permissions on every
    /// repository, GitLab an admin `PRIVATE-TOKEN` (for `Sudo`), Bitbucket
    /// Server a token that can list repository and project permissions.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_host_request_timeout")]
    pub request_timeout_secs: u64,
    /// Ceiling on concurrent requests to this host.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Minimum number of API calls to keep in reserve before self-throttling.
    #[serde(default = "default_api_rate_limit_buffer")]
    pub api_rate_limit_buffer: u32,
    #[serde(default)]
    pub authz: AuthzConfig,
}

fn default_token_env() -> String {
    "FORGE_ADMIN_TOKEN".to_string()
}

fn default_host_request_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    16
}

fn default_api_rate_limit_buffer() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthzConfig {
    /// Lifetime of cached visibility and user-access records.  `0` means
    /// never trust the cache.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Match local usernames against code host usernames instead of going
    /// through a linked account.
    #[serde(default)]
    pub native_username: bool,
    /// Authentication provider whose linked accounts identify users on this
    /// code host.  Required unless `native_username` is set.
    #[serde(default)]
    pub authn_config_id: Option<String>,
    /// GitLab `provider` name for `extern_uid` lookups.  Defaults to
    /// `authn_config_id`.
    #[serde(default)]
    pub gitlab_provider: Option<String>,
    /// Callers without an identity on this host get no answers at all.
    #[serde(default)]
    pub require_identity: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// List the caller's accessible repositories in one go once this many
    /// repositories need a remote answer.  Unset disables listing.
    #[serde(default)]
    pub bulk_list_threshold: Option<usize>,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            native_username: false,
            authn_config_id: None,
            gitlab_provider: None,
            require_identity: false,
            max_concurrency: default_max_concurrency(),
            bulk_list_threshold: None,
        }
    }
}

fn default_ttl() -> u64 {
    3 * 60 * 60
}

fn default_max_concurrency() -> usize {
    16
}

impl CodeHostConfig {
    pub fn code_host(&self) -> CodeHost {
        CodeHost::new(&self.url, self.kind.service_type())
    }

    pub fn service_id(&self) -> String {
        self.code_host().service_id
    }

    /// The configured API root, or the conventional one for the kind.
    pub fn api_url(&self) -> Result<Url> {
        if let Some(api_url) = &self.api_url {
            return Ok(api_url.clone());
        }
        match self.kind {
            CodeHostKind::Github if self.url.host_str() == Some("github.com") => {
                Url::parse("https://api.github.com").context("invalid GitHub API URL")
            }
            CodeHostKind::Github => append_path(&self.url, &["api", "v3"]),
            CodeHostKind::Gitlab => append_path(&self.url, &["api", "v4"]),
            CodeHostKind::BitbucketServer => append_path(&self.url, &["rest", "api", "1.0"]),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.authz.ttl_secs)
    }

    pub fn identity_mode(&self) -> Result<IdentityMode> {
        if self.authz.native_username {
            return Ok(IdentityMode::NativeUsername);
        }
        let authn_config_id = self.authz.authn_config_id.clone().ok_or_else(|| {
            anyhow!(
                "code host {} needs authz.authn_config_id or authz.native_username",
                self.url
            )
        })?;
        Ok(IdentityMode::LinkedAccount { authn_config_id })
    }

    pub fn gitlab_provider(&self) -> Option<String> {
        self.authz
            .gitlab_provider
            .clone()
            .or_else(|| self.authz.authn_config_id.clone())
    }
}

fn append_path(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("code host URL {base} cannot be a base"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.code_hosts.is_empty(),
        "at least one code host must be configured"
    );
    anyhow::ensure!(
        config.cache.backend != CacheBackend::Keydb || config.cache.keydb.is_some(),
        "cache.keydb is required when cache.backend is keydb"
    );
    if let Some(keydb) = &config.cache.keydb {
        anyhow::ensure!(keydb.pool_size > 0, "cache.keydb.pool_size must be at least 1");
    }

    let authn_ids: HashSet<&str> = config
        .auth_providers
        .iter()
        .map(|p| p.config_id.as_str())
        .collect();
    anyhow::ensure!(
        authn_ids.len() == config.auth_providers.len(),
        "auth provider config IDs must be unique"
    );

    let mut service_ids = HashSet::new();
    for host in &config.code_hosts {
        anyhow::ensure!(
            service_ids.insert(host.service_id()),
            "code host {} is configured more than once",
            host.url
        );
        anyhow::ensure!(
            host.max_connections > 0 && host.authz.max_concurrency > 0,
            "code host {}: max_connections and authz.max_concurrency must be at least 1",
            host.url
        );
        anyhow::ensure!(
            host.authz.ttl_secs <= MAX_TTL.as_secs(),
            "code host {}: authz.ttl_secs must be at most {} (one year)",
            host.url,
            MAX_TTL.as_secs()
        );
        if let IdentityMode::LinkedAccount { authn_config_id } = host.identity_mode()? {
            anyhow::ensure!(
                authn_ids.contains(authn_config_id.as_str()),
                "code host {} links identities through unknown auth provider {authn_config_id:?}",
                host.url
            );
        }
        host.api_url()?;
    }
    Ok(())
}
