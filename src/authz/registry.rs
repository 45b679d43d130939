//! Lookup tables over the configured authentication providers and the live
//! permission providers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{ensure, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::PermissionProvider;
use super::types::{ExternalAccount, Repo, RepoPerms, User};
use crate::error::AuthzError;

// ---------------------------------------------------------------------------
// Authentication providers
// ---------------------------------------------------------------------------

/// An authentication provider users link external accounts through.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct AuthnProvider {
    pub config_id: String,
    pub service_type: String,
    pub service_id: String,
}

impl AuthnProvider {
    /// Whether `account` was linked through this provider.
    pub fn links(&self, account: &ExternalAccount) -> bool {
        account.service_type == self.service_type && account.service_id == self.service_id
    }
}

/// Authentication providers keyed by configuration ID.
#[derive(Debug, Clone, Default)]
pub struct AuthnRegistry {
    by_config_id: HashMap<String, AuthnProvider>,
}

impl AuthnRegistry {
    pub fn new(providers: impl IntoIterator<Item = AuthnProvider>) -> Self {
        Self {
            by_config_id: providers
                .into_iter()
                .map(|p| (p.config_id.clone(), p))
                .collect(),
        }
    }

    pub fn get(&self, config_id: &str) -> Option<&AuthnProvider> {
        self.by_config_id.get(config_id)
    }

    pub fn len(&self) -> usize {
        self.by_config_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_config_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Permission providers
// ---------------------------------------------------------------------------

/// Every live [`PermissionProvider`], indexed by the code host it serves
/// and by the authentication provider its identities come from.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<PermissionProvider>>,
    by_service_id: HashMap<String, usize>,
    by_authn_config_id: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<PermissionProvider>>) -> Result<Self> {
        let mut by_service_id = HashMap::new();
        let mut by_authn_config_id = HashMap::new();
        for (i, provider) in providers.iter().enumerate() {
            let previous = by_service_id.insert(provider.service_id().to_owned(), i);
            ensure!(
                previous.is_none(),
                "two code hosts share service ID {}",
                provider.service_id()
            );
            if let Some(config_id) = provider.authn_config_id() {
                by_authn_config_id.entry(config_id.to_owned()).or_insert(i);
            }
        }
        Ok(Self {
            providers,
            by_service_id,
            by_authn_config_id,
        })
    }

    pub fn providers(&self) -> &[Arc<PermissionProvider>] {
        &self.providers
    }

    pub fn provider_for_service(&self, service_id: &str) -> Option<&Arc<PermissionProvider>> {
        self.by_service_id
            .get(service_id)
            .map(|&i| &self.providers[i])
    }

    /// The provider whose identities are resolved through the given
    /// authentication provider.  When several code hosts share one, the
    /// first configured wins.
    pub fn provider_for_authn(&self, config_id: &str) -> Option<&Arc<PermissionProvider>> {
        self.by_authn_config_id
            .get(config_id)
            .map(|&i| &self.providers[i])
    }

    /// Resolve `repos` against every code host and merge the answers.
    ///
    /// Repositories that belong to no configured code host are absent from
    /// the result.  A configuration-class error from any provider fails the
    /// whole request; any other provider failure only drops that code
    /// host's repositories.
    pub async fn repo_perms(
        &self,
        user: Option<&User>,
        accounts: &[ExternalAccount],
        repos: &HashSet<Repo>,
        cancel: &CancellationToken,
    ) -> Result<RepoPerms, AuthzError> {
        let mut remaining = repos.clone();
        let mut batches = Vec::new();
        for provider in &self.providers {
            if remaining.is_empty() {
                break;
            }
            let (mine, others) = provider.repos(&remaining);
            remaining = others;
            if !mine.is_empty() {
                batches.push((provider, mine));
            }
        }
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "repositories with no configured code host");
        }

        let results = join_all(
            batches
                .iter()
                .map(|(provider, mine)| provider.resolve(user, accounts, mine, cancel)),
        )
        .await;

        let mut perms = RepoPerms::new();
        for ((provider, mine), result) in batches.iter().zip(results) {
            match result {
                Ok(map) => perms.extend(map),
                Err(err) if err.is_configuration() => return Err(err),
                Err(err) => warn!(
                    service_id = %provider.service_id(),
                    undecided = mine.len(),
                    error = %err,
                    "code host unavailable, its repositories are left undecided"
                ),
            }
        }
        Ok(perms)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::authz::types::{Perms, RemoteUser, Visibility};
    use crate::forge::testing::{FakeClient, LookupFailure};
    use crate::forge::IdentityMode;

    fn repo(host: &str, service_type: &str, id: u64) -> Repo {
        Repo {
            name: format!("{host}/org/r{id}"),
            service_type: service_type.into(),
            service_id: format!("https://{host}/"),
            external_id: id.to_string(),
        }
    }

    fn provider(client: FakeClient, mode: IdentityMode) -> Arc<PermissionProvider> {
        Arc::new(
            PermissionProvider::builder(Arc::new(client), Arc::new(AuthnRegistry::default()))
                .identity_mode(mode)
                .ttl(Duration::ZERO)
                .build(),
        )
    }

    fn alice() -> User {
        User {
            id: 1,
            username: "alice".into(),
        }
    }

    #[test]
    fn linked_accounts_match_on_type_and_id() {
        let provider = AuthnProvider {
            config_id: "okta".into(),
            service_type: "saml".into(),
            service_id: "https://idp.example.com/".into(),
        };
        let mut account = ExternalAccount {
            service_type: "saml".into(),
            service_id: "https://idp.example.com/".into(),
            account_id: "alice".into(),
        };
        assert!(provider.links(&account));
        account.service_type = "openidconnect".into();
        assert!(!provider.links(&account));
    }

    #[test]
    fn duplicate_service_ids_are_rejected() {
        let a = provider(FakeClient::gitlab(), IdentityMode::NativeUsername);
        let b = provider(FakeClient::gitlab(), IdentityMode::NativeUsername);
        assert!(ProviderRegistry::new(vec![a, b]).is_err());
    }

    #[test]
    fn lookups_by_service_and_authn() {
        let gitlab = provider(
            FakeClient::gitlab(),
            IdentityMode::LinkedAccount {
                authn_config_id: "okta".into(),
            },
        );
        let github = provider(
            FakeClient::new("github", "https://github.example.com"),
            IdentityMode::NativeUsername,
        );
        let registry = ProviderRegistry::new(vec![gitlab, github]).unwrap();

        assert_eq!(registry.providers().len(), 2);
        assert_eq!(
            registry
                .provider_for_service("https://github.example.com/")
                .map(|p| p.service_type()),
            Some("github")
        );
        assert_eq!(
            registry.provider_for_authn("okta").map(|p| p.service_type()),
            Some("gitlab")
        );
        assert!(registry.provider_for_authn("github").is_none());
        assert!(registry.provider_for_service("https://nowhere.example.com/").is_none());
    }

    #[tokio::test]
    async fn merges_per_host_answers_and_drops_unknown_hosts() {
        let gitlab = FakeClient::gitlab();
        gitlab.with_users(vec![RemoteUser {
            id: "5".into(),
            username: "alice".into(),
        }]);
        gitlab.answer(1, true, Visibility::Public, true);
        let github = FakeClient::new("github", "https://github.example.com");
        github.with_users(vec![RemoteUser {
            id: "50".into(),
            username: "alice".into(),
        }]);
        github.answer(2, true, Visibility::Private, true);

        let registry = ProviderRegistry::new(vec![
            provider(gitlab, IdentityMode::NativeUsername),
            provider(github, IdentityMode::NativeUsername),
        ])
        .unwrap();

        let repos: HashSet<Repo> = [
            repo("gitlab.example.com", "gitlab", 1),
            repo("github.example.com", "github", 2),
            repo("bitbucket.example.com", "bitbucketServer", 3),
        ]
        .into_iter()
        .collect();

        let perms = registry
            .repo_perms(Some(&alice()), &[], &repos, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms["gitlab.example.com/org/r1"], Perms::READ);
        assert_eq!(perms["github.example.com/org/r2"], Perms::READ);
    }

    #[tokio::test]
    async fn configuration_error_fails_whole_request() {
        let gitlab = FakeClient::gitlab();
        gitlab.answer(1, true, Visibility::Public, true);
        let github = FakeClient::new("github", "https://github.example.com");
        github.with_users(vec![
            RemoteUser {
                id: "50".into(),
                username: "alice".into(),
            },
            RemoteUser {
                id: "51".into(),
                username: "alice".into(),
            },
        ]);

        let registry = ProviderRegistry::new(vec![
            provider(gitlab, IdentityMode::NativeUsername),
            provider(github, IdentityMode::NativeUsername),
        ])
        .unwrap();
        let repos: HashSet<Repo> = [
            repo("gitlab.example.com", "gitlab", 1),
            repo("github.example.com", "github", 2),
        ]
        .into_iter()
        .collect();

        let err = registry
            .repo_perms(Some(&alice()), &[], &repos, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn unreachable_host_only_drops_its_own_repos() {
        let gitlab = FakeClient::gitlab();
        gitlab.answer(1, true, Visibility::Public, true);
        let github = FakeClient::new("github", "https://github.example.com");
        github.fail_lookups(LookupFailure::Fail("connection reset by peer".into()));
        github.answer(2, true, Visibility::Public, true);

        let registry = ProviderRegistry::new(vec![
            provider(gitlab, IdentityMode::NativeUsername),
            provider(github, IdentityMode::NativeUsername),
        ])
        .unwrap();
        let repos: HashSet<Repo> = [
            repo("gitlab.example.com", "gitlab", 1),
            repo("github.example.com", "github", 2),
        ]
        .into_iter()
        .collect();

        let perms = registry
            .repo_perms(Some(&alice()), &[], &repos, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(perms.len(), 1);
        assert_eq!(perms["gitlab.example.com/org/r1"], Perms::READ);
    }
}
