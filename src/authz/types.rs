use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const SERVICE_TYPE_GITHUB: &str = "github";
pub const SERVICE_TYPE_GITLAB: &str = "gitlab";
pub const SERVICE_TYPE_BITBUCKET_SERVER: &str = "bitbucketServer";

// ---------------------------------------------------------------------------
// Code host
// ---------------------------------------------------------------------------

/// A configured code host instance.  The service ID is the normalised base
/// URL (always ending in `/`), so two connections to the same host share
/// one ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeHost {
    pub service_type: String,
    pub service_id: String,
}

impl CodeHost {
    pub fn new(base_url: &url::Url, service_type: &str) -> Self {
        Self {
            service_type: service_type.to_owned(),
            service_id: normalize_service_id(base_url),
        }
    }

    pub fn owns(&self, repo: &Repo) -> bool {
        repo.service_type == self.service_type && repo.service_id == self.service_id
    }
}

fn normalize_service_id(base_url: &url::Url) -> String {
    let mut url = base_url.clone();
    url.set_query(None);
    url.set_fragment(None);
    let mut id = url.to_string();
    if !id.ends_with('/') {
        id.push('/');
    }
    id
}

// ---------------------------------------------------------------------------
// Users and identities
// ---------------------------------------------------------------------------

/// A local user of the calling application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// An account the local user has linked from some external service
/// (an SSO provider, or a code host itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
}

/// A user's account on one code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
    /// Login name on the code host; some APIs address users by it.
    pub username: String,
}

/// A user record returned by a code host user lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub id: String,
    pub username: String,
}

impl RemoteUser {
    pub fn into_identity(self, host: &CodeHost) -> Identity {
        Identity {
            service_type: host.service_type.clone(),
            service_id: host.service_id.clone(),
            account_id: self.id,
            username: self.username,
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// A repository as the calling application knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    /// Canonical internal name, the key of the decision map.
    pub name: String,
    pub service_type: String,
    pub service_id: String,
    /// Opaque ID on the code host; numeric for every supported host.
    pub external_id: String,
}

/// A repository whose external ID has been parsed to the host's native ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

impl Visibility {
    /// Parse the visibility strings GitHub and GitLab return.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Private => "private",
        })
    }
}

/// Answer to "what does this identity see of repository R".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVisibility {
    /// The identity can see that the repository exists.
    pub accessible: bool,
    pub visibility: Visibility,
    /// The identity can read the repository contents.
    pub content_accessible: bool,
}

impl RemoteVisibility {
    /// What a host answers for a repository the identity cannot see.
    pub const HIDDEN: Self = Self {
        accessible: false,
        visibility: Visibility::Private,
        content_accessible: false,
    };

    /// The read decision for this answer.  For private repositories both
    /// flags must hold; this is also what gets cached per user.
    pub fn can_read(&self) -> bool {
        match self.visibility {
            Visibility::Public | Visibility::Internal => self.accessible,
            Visibility::Private => self.accessible && self.content_accessible,
        }
    }
}

/// One entry of a bulk accessible-repository listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepo {
    pub id: u64,
    pub access: RemoteVisibility,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    pub read: bool,
}

impl Perms {
    pub const READ: Self = Self { read: true };
    pub const NONE: Self = Self { read: false };

    pub fn read(read: bool) -> Self {
        Self { read }
    }
}

/// Repository name → permissions.  A repository missing from the map must
/// be treated as denied.
pub type RepoPerms = HashMap<String, Perms>;
