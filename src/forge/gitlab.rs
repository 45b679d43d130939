//! GitLab client.
//!
//! Requests on behalf of an identity use the admin token plus the `Sudo`
//! header, so GitLab itself answers what that user can see.  Anonymous
//! requests carry no token at all.

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use super::http::ApiClient;
use super::{ClientSettings, CodeHostClient};
use crate::authz::types::{
    CodeHost, ExternalAccount, Identity, RemoteRepo, RemoteUser, RemoteVisibility, RepoRef,
    Visibility, SERVICE_TYPE_GITLAB,
};

/// Reporter.  The lowest access level that can read repository contents
/// when the repository feature is restricted to members.
const REPORTER_ACCESS: u32 = 20;

const PAGE_SIZE: &str = "100";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GlProject {
    id: u64,
    visibility: String,
    /// `enabled`, `private` or `disabled`.
    #[serde(default)]
    repository_access_level: Option<String>,
    #[serde(default)]
    permissions: Option<GlPermissions>,
}

#[derive(Debug, Default, Deserialize)]
struct GlPermissions {
    project_access: Option<GlAccess>,
    group_access: Option<GlAccess>,
}

#[derive(Debug, Deserialize)]
struct GlAccess {
    access_level: u32,
}

#[derive(Debug, Deserialize)]
struct GlUser {
    id: u64,
    username: String,
}

impl GlProject {
    fn access_level(&self) -> u32 {
        self.permissions
            .as_ref()
            .map(|p| {
                let project = p.project_access.as_ref().map_or(0, |a| a.access_level);
                let group = p.group_access.as_ref().map_or(0, |a| a.access_level);
                project.max(group)
            })
            .unwrap_or(0)
    }

    /// The project was returned, so it is visible.  Whether its contents are
    /// readable depends on the repository feature setting.
    fn remote_visibility(&self) -> RemoteVisibility {
        // Unknown values are treated as the most restrictive class.
        let visibility = Visibility::parse(&self.visibility).unwrap_or(Visibility::Private);
        let content_accessible = match self.repository_access_level.as_deref() {
            Some("disabled") => false,
            Some("private") => self.access_level() >= REPORTER_ACCESS,
            _ if visibility == Visibility::Private => self.access_level() >= REPORTER_ACCESS,
            _ => true,
        };
        RemoteVisibility {
            accessible: true,
            visibility,
            content_accessible,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitLabClient {
    host: CodeHost,
    api: ApiClient,
    token: String,
    provider: Option<String>,
}

impl GitLabClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        Ok(Self {
            host: CodeHost::new(&settings.url, SERVICE_TYPE_GITLAB),
            api: ApiClient::new(
                settings.api_url.clone(),
                settings.request_timeout,
                settings.max_connections,
                settings.rate_limit_buffer,
            )?,
            token: settings.token.clone(),
            provider: settings.gitlab_provider.clone(),
        })
    }

    fn admin(&self, url: url::Url) -> reqwest::RequestBuilder {
        self.api.get(url).header("PRIVATE-TOKEN", &self.token)
    }

    /// Anonymous requests go out without any token.
    fn as_identity(&self, url: url::Url, identity: Option<&Identity>) -> reqwest::RequestBuilder {
        match identity {
            Some(identity) => self.admin(url).header("Sudo", &identity.account_id),
            None => self.api.get(url),
        }
    }

    async fn users(&self, query: &[(&str, &str)]) -> Result<Vec<RemoteUser>> {
        let mut url = self.api.endpoint(&["users"])?;
        url.query_pairs_mut()
            .extend_pairs(query)
            .append_pair("per_page", "2");
        let found = self.api.fetch_json::<Vec<GlUser>>(self.admin(url)).await?;
        Ok(found
            .map(|r| r.body)
            .unwrap_or_default()
            .into_iter()
            .map(|u| RemoteUser {
                id: u.id.to_string(),
                username: u.username,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl CodeHostClient for GitLabClient {
    fn code_host(&self) -> &CodeHost {
        &self.host
    }

    async fn find_users_by_username(&self, username: &str) -> Result<Vec<RemoteUser>> {
        self.users(&[("username", username)]).await
    }

    async fn find_users_by_external_account(
        &self,
        account: &ExternalAccount,
    ) -> Result<Vec<RemoteUser>> {
        let provider = self.provider.as_deref().unwrap_or(&account.service_type);
        self.users(&[("extern_uid", account.account_id.as_str()), ("provider", provider)])
            .await
    }

    async fn fetch_visibility(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
    ) -> Result<RemoteVisibility> {
        let url = self.api.endpoint(&["projects", &repo.id.to_string()])?;
        let Some(found) = self
            .api
            .fetch_json::<GlProject>(self.as_identity(url, identity))
            .await?
        else {
            return Ok(RemoteVisibility::HIDDEN);
        };
        let answer = found.body.remote_visibility();
        debug!(
            project_id = found.body.id,
            visibility = %answer.visibility,
            content_accessible = answer.content_accessible,
            "GitLab project fetched"
        );
        Ok(answer)
    }

    fn supports_bulk_listing(&self) -> bool {
        true
    }

    async fn list_accessible_repos(&self, identity: &Identity) -> Result<Vec<RemoteRepo>> {
        let mut repos = Vec::new();
        let mut page = "1".to_string();
        loop {
            let mut url = self.api.endpoint(&["projects"])?;
            url.query_pairs_mut()
                .append_pair("per_page", PAGE_SIZE)
                .append_pair("page", &page);
            let Some(resp) = self
                .api
                .fetch_json::<Vec<GlProject>>(self.as_identity(url, Some(identity)))
                .await?
            else {
                break;
            };
            repos.extend(resp.body.iter().map(|p| RemoteRepo {
                id: p.id,
                access: p.remote_visibility(),
            }));

            match resp
                .headers
                .get("X-Next-Page")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                Some(next) => page = next.to_owned(),
                None => break,
            }
        }
        debug!(
            account_id = %identity.account_id,
            count = repos.len(),
            "GitLab accessible projects listed"
        );
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> GitLabClient {
        GitLabClient::new(&ClientSettings {
            url: "https://gitlab.example.com".parse().unwrap(),
            api_url: format!("{}/api/v4", server.uri()).parse().unwrap(),
            token: "admin-token".into(),
            request_timeout: Duration::from_secs(5),
            max_connections: 4,
            rate_limit_buffer: 0,
            gitlab_provider: Some("okta".into()),
        })
        .unwrap()
    }

    fn identity() -> Identity {
        Identity {
            service_type: "gitlab".into(),
            service_id: "https://gitlab.example.com/".into(),
            account_id: "U1".into(),
            username: "alice".into(),
        }
    }

    fn repo(id: u64) -> RepoRef {
        RepoRef {
            id,
            name: format!("gitlab.example.com/g/p{id}"),
        }
    }

    fn project(id: u64, visibility: &str, repo_level: &str, access: Option<u32>) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "visibility": visibility,
            "repository_access_level": repo_level,
            "permissions": {
                "project_access": access.map(|l| serde_json::json!({"access_level": l})),
                "group_access": null,
            },
        })
    }

    #[test]
    fn content_access_rules() {
        let parse = |v| serde_json::from_value::<GlProject>(v).unwrap().remote_visibility();

        let public = parse(project(1, "public", "enabled", None));
        assert!(public.can_read());

        let guest_on_private = parse(project(2, "private", "enabled", Some(10)));
        assert!(guest_on_private.accessible);
        assert!(!guest_on_private.can_read());

        let reporter_on_private = parse(project(3, "private", "enabled", Some(30)));
        assert!(reporter_on_private.can_read());

        let disabled = parse(project(4, "internal", "disabled", Some(50)));
        assert!(!disabled.content_accessible);

        let members_only = parse(project(5, "internal", "private", None));
        assert_eq!(members_only.visibility, Visibility::Internal);
        assert!(!members_only.content_accessible);
    }

    #[test]
    fn group_access_counts() {
        let p: GlProject = serde_json::from_value(serde_json::json!({
            "id": 1,
            "visibility": "private",
            "permissions": {"project_access": null, "group_access": {"access_level": 40}},
        }))
        .unwrap();
        assert_eq!(p.access_level(), 40);
        assert!(p.remote_visibility().can_read());
    }

    #[tokio::test]
    async fn fetch_uses_sudo_for_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/7"))
            .and(header("Sudo", "U1"))
            .and(header("PRIVATE-TOKEN", "admin-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(project(7, "private", "enabled", Some(30))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let got = client(&server)
            .fetch_visibility(Some(&identity()), &repo(7))
            .await
            .unwrap();
        assert!(got.can_read());
    }

    #[tokio::test]
    async fn anonymous_fetch_of_hidden_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let got = client(&server).fetch_visibility(None, &repo(7)).await.unwrap();
        assert_eq!(got, RemoteVisibility::HIDDEN);

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("PRIVATE-TOKEN").is_none());
        assert!(requests[0].headers.get("Sudo").is_none());
    }

    #[tokio::test]
    async fn user_lookup_by_extern_uid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("extern_uid", "alice@example.com"))
            .and(query_param("provider", "okta"))
            .and(query_param("per_page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"id": 5, "username": "alice"}])),
            )
            .mount(&server)
            .await;

        let account = ExternalAccount {
            service_type: "saml".into(),
            service_id: "https://idp.example.com/".into(),
            account_id: "alice@example.com".into(),
        };
        let users = client(&server)
            .find_users_by_external_account(&account)
            .await
            .unwrap();
        assert_eq!(
            users,
            vec![RemoteUser {
                id: "5".into(),
                username: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn user_lookup_reports_duplicates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("username", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 5, "username": "alice"},
                {"id": 6, "username": "alice"},
            ])))
            .mount(&server)
            .await;

        let users = client(&server).find_users_by_username("alice").await.unwrap();
        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn listing_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects"))
            .and(query_param("page", "1"))
            .and(header("Sudo", "U1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "2")
                    .set_body_json(serde_json::json!([project(1, "public", "enabled", None)])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "")
                    .set_body_json(serde_json::json!([project(2, "private", "enabled", Some(10))])),
            )
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.supports_bulk_listing());
        let repos = client.list_accessible_repos(&identity()).await.unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos[0].access.can_read());
        assert_eq!(repos[1].id, 2);
        assert!(!repos[1].access.can_read());
    }
}
