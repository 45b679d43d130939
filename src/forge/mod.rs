//! Code host abstraction layer.
//!
//! Provides the [`CodeHostClient`] trait that encapsulates all host-specific
//! API interaction (GitHub, GitLab, Bitbucket Server).  The permission
//! provider dispatches through this trait so that no host-specific URL
//! construction or response parsing leaks outside this module.

pub mod bitbucket_server;
pub mod github;
pub mod gitlab;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::authz::registry::AuthnRegistry;
use crate::authz::types::{
    CodeHost, ExternalAccount, Identity, RemoteRepo, RemoteUser, RemoteVisibility, RepoRef, User,
};
use crate::config::{CodeHostConfig, CodeHostKind};
use crate::error::AuthzError;

// ---------------------------------------------------------------------------
// Identity mode
// ---------------------------------------------------------------------------

/// How a local user is mapped to an account on the code host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    /// Look the remote user up by the local username.
    NativeUsername,
    /// Use the user's linked account from the given authentication provider.
    LinkedAccount { authn_config_id: String },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Read-permission queries against one code host instance.
#[async_trait::async_trait]
pub trait CodeHostClient: Send + Sync {
    fn code_host(&self) -> &CodeHost;

    /// Remote users whose login is exactly `username`.  Implementations
    /// return at most two so that ambiguity can be detected.
    async fn find_users_by_username(&self, username: &str) -> Result<Vec<RemoteUser>>;

    /// Remote users linked to an account of an external authentication
    /// provider.  At most two.
    async fn find_users_by_external_account(
        &self,
        account: &ExternalAccount,
    ) -> Result<Vec<RemoteUser>>;

    /// What `identity` (or an anonymous caller) sees of one repository.
    async fn fetch_visibility(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
    ) -> Result<RemoteVisibility>;

    /// Whether [`list_accessible_repos`](Self::list_accessible_repos) is
    /// implemented for this host.
    fn supports_bulk_listing(&self) -> bool {
        false
    }

    /// Every repository `identity` can see.
    async fn list_accessible_repos(&self, _identity: &Identity) -> Result<Vec<RemoteRepo>> {
        bail!(
            "{} does not support listing repositories on behalf of a user",
            self.code_host().service_type
        )
    }

    /// Map a local user to their account on this code host.
    ///
    /// `Ok(None)` when there is no user, no linked account for the
    /// configured authentication provider, or no remote match.  More than
    /// one remote match is an error rather than an arbitrary pick.
    #[instrument(skip_all, fields(service_id = %self.code_host().service_id))]
    async fn resolve_identity(
        &self,
        user: Option<&User>,
        accounts: &[ExternalAccount],
        mode: &IdentityMode,
        authn: &AuthnRegistry,
    ) -> Result<Option<Identity>, AuthzError> {
        let Some(user) = user else {
            return Ok(None);
        };
        let host = self.code_host();
        let lookup_failed = |cause| AuthzError::IdentityLookup {
            service_id: host.service_id.clone(),
            cause,
        };

        let (query, mut users) = match mode {
            IdentityMode::NativeUsername => {
                let users = self
                    .find_users_by_username(&user.username)
                    .await
                    .map_err(lookup_failed)?;
                (format!("username={}", user.username), users)
            }
            IdentityMode::LinkedAccount { authn_config_id } => {
                let Some(provider) = authn.get(authn_config_id) else {
                    warn!(%authn_config_id, "authentication provider not registered");
                    return Ok(None);
                };
                let Some(account) = accounts.iter().find(|a| provider.links(a)) else {
                    debug!(user_id = user.id, %authn_config_id, "no linked account");
                    return Ok(None);
                };
                let users = self
                    .find_users_by_external_account(account)
                    .await
                    .map_err(lookup_failed)?;
                (format!("extern_uid={}", account.account_id), users)
            }
        };

        if users.len() > 1 {
            return Err(AuthzError::AmbiguousIdentity {
                service_type: host.service_type.clone(),
                query,
                matches: users.len(),
            });
        }
        let identity = users.pop().map(|u| u.into_identity(host));
        debug!(user_id = user.id, found = identity.is_some(), "identity resolved");
        Ok(identity)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Connection settings every client is built from.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Web URL of the host; its normalised form is the service ID.
    pub url: Url,
    pub api_url: Url,
    /// Admin / service-account token.  Empty when unset.
    pub token: String,
    pub request_timeout: Duration,
    pub max_connections: usize,
    pub rate_limit_buffer: u32,
    /// GitLab `provider` name used with `extern_uid` lookups.
    pub gitlab_provider: Option<String>,
}

impl ClientSettings {
    pub fn from_config(config: &CodeHostConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).unwrap_or_default();
        if token.is_empty() {
            warn!(
                env_var = %config.token_env,
                url = %config.url,
                "code host token env var is empty; private repositories will look hidden"
            );
        }
        Ok(Self {
            url: config.url.clone(),
            api_url: config.api_url()?,
            token,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_connections: config.max_connections,
            rate_limit_buffer: config.api_rate_limit_buffer,
            gitlab_provider: config.gitlab_provider(),
        })
    }
}

/// Build the client implementation for the configured host kind.
pub fn build_client(config: &CodeHostConfig) -> Result<Arc<dyn CodeHostClient>> {
    let settings = ClientSettings::from_config(config)?;
    Ok(match config.kind {
        CodeHostKind::Github => Arc::new(github::GitHubClient::new(&settings)?),
        CodeHostKind::Gitlab => Arc::new(gitlab::GitLabClient::new(&settings)?),
        CodeHostKind::BitbucketServer => {
            Arc::new(bitbucket_server::BitbucketServerClient::new(&settings)?)
        }
    })
}
