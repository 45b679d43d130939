//! Bitbucket Server / Data Center client.
//!
//! Bitbucket Server addresses repositories by project key and slug, not by
//! numeric ID, so both are taken from the last two segments of the
//! repository name and the returned ID is cross-checked against the record.
//! There is no impersonation: private access is answered from the
//! repository and project permission lists (direct user grants, then the
//! project's default permission, then grants to any group the user is a
//! member of).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::http::ApiClient;
use super::{ClientSettings, CodeHostClient};
use crate::authz::types::{
    CodeHost, ExternalAccount, Identity, RemoteUser, RemoteVisibility, RepoRef, Visibility,
    SERVICE_TYPE_BITBUCKET_SERVER,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BbsRepo {
    id: u64,
    #[serde(default)]
    public: bool,
    project: BbsProject,
}

#[derive(Debug, Deserialize)]
struct BbsProject {
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
struct BbsUser {
    id: u64,
    name: String,
    slug: String,
}

impl BbsUser {
    fn is(&self, username: &str) -> bool {
        self.name.eq_ignore_ascii_case(username) || self.slug.eq_ignore_ascii_case(username)
    }
}

#[derive(Debug, Deserialize)]
struct BbsUserGrant {
    user: BbsUser,
}

#[derive(Debug, Deserialize)]
struct BbsGroup {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BbsGroupGrant {
    group: BbsGroup,
}

#[derive(Debug, Deserialize)]
struct BbsPermitted {
    permitted: bool,
}

/// Page size for group lookups, which are not narrowed by a filter.
const GROUP_PAGE_LIMIT: &str = "1000";

/// One page of a paged Bitbucket Server collection.  Filters used here are
/// narrow enough that the first page is all that matters.
#[derive(Debug, Deserialize)]
struct Page<T> {
    values: Vec<T>,
}

/// `(project key, repository slug)` from a name such as
/// `bitbucket.example.com/PROJ/repo`.
fn project_and_slug(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.trim_end_matches('/').rsplit('/');
    let slug = parts.next().filter(|s| !s.is_empty())?;
    let key = parts.next().filter(|s| !s.is_empty())?;
    Some((key, slug))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BitbucketServerClient {
    host: CodeHost,
    api: ApiClient,
    token: String,
}

impl BitbucketServerClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        Ok(Self {
            host: CodeHost::new(&settings.url, SERVICE_TYPE_BITBUCKET_SERVER),
            api: ApiClient::new(
                settings.api_url.clone(),
                settings.request_timeout,
                settings.max_connections,
                settings.rate_limit_buffer,
            )?,
            token: settings.token.clone(),
        })
    }

    fn request(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<reqwest::RequestBuilder> {
        let mut url = self.api.endpoint(segments)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let req = self.api.get(url);
        Ok(if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        })
    }

    async fn grant_listed(&self, segments: &[&str], username: &str) -> Result<bool> {
        let found = self
            .api
            .fetch_json::<Page<BbsUserGrant>>(
                self.request(segments, &[("filter", username)])?,
            )
            .await?;
        Ok(found.is_some_and(|p| p.body.values.iter().any(|g| g.user.is(username))))
    }

    /// Whether every licensed user may read the project's repositories.
    async fn project_readable_by_default(&self, key: &str) -> Result<bool> {
        let found = self
            .api
            .fetch_json::<BbsPermitted>(self.request(
                &["projects", key, "permissions", "PROJECT_READ", "all"],
                &[],
            )?)
            .await?;
        Ok(found.is_some_and(|p| p.body.permitted))
    }

    /// Names of the groups `username` belongs to.
    async fn groups_of(&self, username: &str) -> Result<Vec<String>> {
        let found = self
            .api
            .fetch_json::<Page<BbsGroup>>(self.request(
                &["admin", "users", "more-members"],
                &[("context", username), ("limit", GROUP_PAGE_LIMIT)],
            )?)
            .await?;
        Ok(found
            .map(|p| p.body.values.into_iter().map(|g| g.name).collect())
            .unwrap_or_default())
    }

    async fn group_granted(&self, segments: &[&str], groups: &[String]) -> Result<bool> {
        let found = self
            .api
            .fetch_json::<Page<BbsGroupGrant>>(
                self.request(segments, &[("limit", GROUP_PAGE_LIMIT)])?,
            )
            .await?;
        Ok(found.is_some_and(|p| {
            p.body
                .values
                .iter()
                .any(|g| groups.iter().any(|m| m.eq_ignore_ascii_case(&g.group.name)))
        }))
    }

    /// Any grant, repository or project level, direct or through a group,
    /// includes read.
    async fn has_grant(&self, key: &str, slug: &str, username: &str) -> Result<bool> {
        if self
            .grant_listed(
                &["projects", key, "repos", slug, "permissions", "users"],
                username,
            )
            .await?
            || self
                .grant_listed(&["projects", key, "permissions", "users"], username)
                .await?
            || self.project_readable_by_default(key).await?
        {
            return Ok(true);
        }

        let groups = self.groups_of(username).await?;
        if groups.is_empty() {
            return Ok(false);
        }
        Ok(self
            .group_granted(
                &["projects", key, "repos", slug, "permissions", "groups"],
                &groups,
            )
            .await?
            || self
                .group_granted(&["projects", key, "permissions", "groups"], &groups)
                .await?)
    }
}

#[async_trait::async_trait]
impl CodeHostClient for BitbucketServerClient {
    fn code_host(&self) -> &CodeHost {
        &self.host
    }

    async fn find_users_by_username(&self, username: &str) -> Result<Vec<RemoteUser>> {
        let found = self
            .api
            .fetch_json::<Page<BbsUser>>(self.request(&["users"], &[("filter", username)])?)
            .await?;
        // `filter` is a substring match; keep exact matches only.
        Ok(found
            .map(|p| p.body.values)
            .unwrap_or_default()
            .into_iter()
            .filter(|u| u.is(username))
            .map(|u| RemoteUser {
                id: u.id.to_string(),
                username: u.slug,
            })
            .collect())
    }

    /// Linked accounts are expected to carry the Bitbucket username.
    async fn find_users_by_external_account(
        &self,
        account: &ExternalAccount,
    ) -> Result<Vec<RemoteUser>> {
        self.find_users_by_username(&account.account_id).await
    }

    async fn fetch_visibility(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
    ) -> Result<RemoteVisibility> {
        let (key, slug) = project_and_slug(&repo.name)
            .with_context(|| format!("repository name {:?} has no project/slug", repo.name))?;

        let Some(found) = self
            .api
            .fetch_json::<BbsRepo>(self.request(&["projects", key, "repos", slug], &[])?)
            .await?
        else {
            return Ok(RemoteVisibility::HIDDEN);
        };
        if found.body.id != repo.id {
            bail!(
                "Bitbucket Server repository {key}/{slug} has ID {}, expected {}",
                found.body.id,
                repo.id
            );
        }

        if found.body.public || found.body.project.public {
            return Ok(RemoteVisibility {
                accessible: true,
                visibility: Visibility::Public,
                content_accessible: true,
            });
        }

        let readable = match identity {
            Some(identity) => self.has_grant(key, slug, &identity.username).await?,
            None => false,
        };
        debug!(repo_id = repo.id, readable, "Bitbucket Server private repository checked");
        Ok(RemoteVisibility {
            accessible: readable,
            visibility: Visibility::Private,
            content_accessible: readable,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> BitbucketServerClient {
        BitbucketServerClient::new(&ClientSettings {
            url: "https://bitbucket.example.com".parse().unwrap(),
            api_url: format!("{}/rest/api/1.0", server.uri()).parse().unwrap(),
            token: "admin-token".into(),
            request_timeout: Duration::from_secs(5),
            max_connections: 4,
            rate_limit_buffer: 0,
            gitlab_provider: None,
        })
        .unwrap()
    }

    fn identity() -> Identity {
        Identity {
            service_type: "bitbucketServer".into(),
            service_id: "https://bitbucket.example.com/".into(),
            account_id: "12".into(),
            username: "alice".into(),
        }
    }

    fn repo(id: u64) -> RepoRef {
        RepoRef {
            id,
            name: "bitbucket.example.com/PROJ/app".into(),
        }
    }

    async fn mount_repo(server: &MockServer, id: u64, public: bool) {
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": id,
                "slug": "app",
                "public": public,
                "project": {"key": "PROJ", "public": false},
            })))
            .mount(server)
            .await;
    }

    fn grants(names: &[&str]) -> serde_json::Value {
        let values: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                serde_json::json!({
                    "user": {"id": i, "name": n, "slug": n.to_lowercase()},
                    "permission": "REPO_READ",
                })
            })
            .collect();
        serde_json::json!({"values": values, "isLastPage": true})
    }

    #[test]
    fn splits_project_and_slug() {
        assert_eq!(
            project_and_slug("bitbucket.example.com/PROJ/app"),
            Some(("PROJ", "app"))
        );
        assert_eq!(project_and_slug("app"), None);
    }

    #[tokio::test]
    async fn public_repository() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, true).await;
        let got = client(&server).fetch_visibility(None, &repo(3)).await.unwrap();
        assert_eq!(got.visibility, Visibility::Public);
        assert!(got.can_read());
    }

    #[tokio::test]
    async fn id_mismatch_is_an_error() {
        let server = MockServer::start().await;
        mount_repo(&server, 4, true).await;
        let err = client(&server)
            .fetch_visibility(None, &repo(3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn private_repository_with_project_grant() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, false).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/app/permissions/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grants(&[])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/permissions/users"))
            .and(query_param("filter", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grants(&["Alice"])))
            .mount(&server)
            .await;

        let got = client(&server)
            .fetch_visibility(Some(&identity()), &repo(3))
            .await
            .unwrap();
        assert_eq!(got.visibility, Visibility::Private);
        assert!(got.can_read());
    }

    #[tokio::test]
    async fn private_repository_substring_grant_does_not_count() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, false).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/app/permissions/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grants(&["alice2"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/permissions/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grants(&[])))
            .mount(&server)
            .await;

        let got = client(&server)
            .fetch_visibility(Some(&identity()), &repo(3))
            .await
            .unwrap();
        assert!(!got.can_read());
    }

    #[tokio::test]
    async fn private_repository_with_group_grant() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, false).await;
        for p in [
            "/rest/api/1.0/projects/PROJ/repos/app/permissions/users",
            "/rest/api/1.0/projects/PROJ/permissions/users",
            "/rest/api/1.0/projects/PROJ/permissions/groups",
        ] {
            Mock::given(method("GET"))
                .and(path(p))
                .respond_with(ResponseTemplate::new(200).set_body_json(grants(&[])))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/permissions/PROJECT_READ/all"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"permitted": false})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/admin/users/more-members"))
            .and(query_param("context", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"name": "developers"}, {"name": "everyone"}],
                "isLastPage": true,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/repos/app/permissions/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"group": {"name": "Developers"}, "permission": "REPO_WRITE"}],
                "isLastPage": true,
            })))
            .mount(&server)
            .await;

        let got = client(&server)
            .fetch_visibility(Some(&identity()), &repo(3))
            .await
            .unwrap();
        assert_eq!(got.visibility, Visibility::Private);
        assert!(got.can_read());
    }

    #[tokio::test]
    async fn private_repository_with_project_default_read() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, false).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/PROJ/permissions/PROJECT_READ/all"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"permitted": true})),
            )
            .mount(&server)
            .await;

        // User grant lists are unmocked and answer 404, which counts as no
        // grant.
        let got = client(&server)
            .fetch_visibility(Some(&identity()), &repo(3))
            .await
            .unwrap();
        assert!(got.can_read());
    }

    #[tokio::test]
    async fn private_repository_is_hidden_from_anonymous() {
        let server = MockServer::start().await;
        mount_repo(&server, 3, false).await;
        let got = client(&server).fetch_visibility(None, &repo(3)).await.unwrap();
        assert!(!got.accessible);
        // No permission lookups for anonymous callers.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_lookup_keeps_exact_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/users"))
            .and(query_param("filter", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [
                    {"id": 1, "name": "alice", "slug": "alice"},
                    {"id": 2, "name": "alice.smith", "slug": "alice.smith"},
                ],
            })))
            .mount(&server)
            .await;

        let users = client(&server).find_users_by_username("alice").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "1");
    }
}
