//! Error kinds the permission pipeline has to branch on.
//!
//! Anything that only affects completeness or freshness (a single failed
//! remote lookup, an unreachable cache) is logged and degraded at the call
//! site.  The variants below are the ones that either change what the
//! orchestrator does next ([`CacheError`]) or abort a whole batch
//! ([`AuthzError`]).

use std::num::ParseIntError;

/// Failure talking to the shared key/value store.
///
/// A missing key is *not* an error: stores return `Ok(None)` for that.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The store could not be reached or rejected the command.
    #[error("cache transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A cached value could not be encoded or decoded.
    #[error("cache value codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }
}

/// Errors that make a permission decision map semantically wrong and so
/// abort the enclosing batch.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// A repository record carries an external ID the code host cannot use.
    #[error("{service_type} repository external ID {id:?} is not a valid numeric ID")]
    MalformedRepoId {
        service_type: String,
        id: String,
        #[source]
        source: ParseIntError,
    },

    /// More than one remote user matched a lookup that must be unique.
    #[error("failed to determine unique {service_type} user for query {query:?} ({matches} matches)")]
    AmbiguousIdentity {
        service_type: String,
        query: String,
        matches: usize,
    },

    /// The remote user lookup itself failed.
    #[error("identity lookup against {service_id} failed: {cause:#}")]
    IdentityLookup {
        service_id: String,
        cause: anyhow::Error,
    },
}

impl AuthzError {
    /// `true` for the configuration class: the input data or the code host
    /// configuration is wrong, retrying will not help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MalformedRepoId { .. } | Self::AmbiguousIdentity { .. }
        )
    }
}
