//! GitHub / GitHub Enterprise client.
//!
//! Every call uses the admin token.  Private repository access is answered
//! by the collaborator permission endpoint rather than by impersonating the
//! user, which GitHub does not support.

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use super::http::ApiClient;
use super::{ClientSettings, CodeHostClient};
use crate::authz::types::{
    CodeHost, ExternalAccount, Identity, RemoteUser, RemoteVisibility, RepoRef, Visibility,
    SERVICE_TYPE_GITHUB,
};

const ACCEPT: &str = "application/vnd.github+json";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GhRepository {
    id: u64,
    private: bool,
    /// `public`, `private` or `internal`.  Absent on old GHES versions.
    #[serde(default)]
    visibility: Option<String>,
}

impl GhRepository {
    fn visibility(&self) -> Visibility {
        self.visibility
            .as_deref()
            .and_then(Visibility::parse)
            .unwrap_or(if self.private {
                Visibility::Private
            } else {
                Visibility::Public
            })
    }
}

#[derive(Debug, Deserialize)]
struct GhUser {
    id: u64,
    login: String,
}

impl From<GhUser> for RemoteUser {
    fn from(u: GhUser) -> Self {
        RemoteUser {
            id: u.id.to_string(),
            username: u.login,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhCollaboratorPermission {
    permission: String,
}

/// Collaborator permissions that include reading the repository contents.
fn permission_grants_read(permission: &str) -> bool {
    matches!(
        permission,
        "admin" | "maintain" | "write" | "triage" | "read"
    )
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    host: CodeHost,
    api: ApiClient,
    token: String,
}

impl GitHubClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        Ok(Self {
            host: CodeHost::new(&settings.url, SERVICE_TYPE_GITHUB),
            api: ApiClient::new(
                settings.api_url.clone(),
                settings.request_timeout,
                settings.max_connections,
                settings.rate_limit_buffer,
            )?,
            token: settings.token.clone(),
        })
    }

    fn request(&self, segments: &[&str]) -> Result<reqwest::RequestBuilder> {
        let req = self
            .api
            .get(self.api.endpoint(segments)?)
            .header("Accept", ACCEPT);
        Ok(if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        })
    }

    async fn user(&self, segments: &[&str]) -> Result<Vec<RemoteUser>> {
        let found = self
            .api
            .fetch_json::<GhUser>(self.request(segments)?)
            .await?;
        Ok(found.map(|r| r.body.into()).into_iter().collect())
    }

    async fn is_collaborator(&self, repo_id: u64, login: &str) -> Result<bool> {
        let id = repo_id.to_string();
        let found = self
            .api
            .fetch_json::<GhCollaboratorPermission>(self.request(&[
                "repositories",
                &id,
                "collaborators",
                login,
                "permission",
            ])?)
            .await?;
        Ok(found.is_some_and(|r| permission_grants_read(&r.body.permission)))
    }
}

#[async_trait::async_trait]
impl CodeHostClient for GitHubClient {
    fn code_host(&self) -> &CodeHost {
        &self.host
    }

    async fn find_users_by_username(&self, username: &str) -> Result<Vec<RemoteUser>> {
        self.user(&["users", username]).await
    }

    /// An account linked from this GitHub instance carries the numeric user
    /// ID; any other provider is expected to carry the GitHub login.
    async fn find_users_by_external_account(
        &self,
        account: &ExternalAccount,
    ) -> Result<Vec<RemoteUser>> {
        if account.service_type == SERVICE_TYPE_GITHUB && account.account_id.parse::<u64>().is_ok()
        {
            self.user(&["user", &account.account_id]).await
        } else {
            self.user(&["users", &account.account_id]).await
        }
    }

    async fn fetch_visibility(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
    ) -> Result<RemoteVisibility> {
        let id = repo.id.to_string();
        let Some(found) = self
            .api
            .fetch_json::<GhRepository>(self.request(&["repositories", &id])?)
            .await?
        else {
            return Ok(RemoteVisibility::HIDDEN);
        };
        let visibility = found.body.visibility();
        debug!(repo_id = found.body.id, %visibility, "GitHub repository fetched");

        let answer = match (visibility, identity) {
            (Visibility::Public, _) => RemoteVisibility {
                accessible: true,
                visibility,
                content_accessible: true,
            },
            (Visibility::Internal, Some(_)) => RemoteVisibility {
                accessible: true,
                visibility,
                content_accessible: true,
            },
            (Visibility::Private, Some(identity)) => {
                let readable = self.is_collaborator(repo.id, &identity.username).await?;
                RemoteVisibility {
                    accessible: readable,
                    visibility,
                    content_accessible: readable,
                }
            }
            (Visibility::Internal | Visibility::Private, None) => RemoteVisibility {
                accessible: false,
                visibility,
                content_accessible: false,
            },
        };
        Ok(answer)
    }
}
