//! Read-permission resolution for one code host.
//!
//! A request runs through five stages, each narrowing the set of
//! repositories still undecided:
//!
//! 1. resolve the caller's identity on the code host;
//! 2. decide from a live [`VisibilityRecord`] where visibility alone is
//!    enough (public; internal with an identity; anything non-public
//!    without one);
//! 3. for live private records, decide from a live [`UserAccessRecord`];
//! 4. ask the code host for the rest and write both record kinds back;
//! 5. return the accumulated decisions.
//!
//! Stages 2 and 3 run per repository, concurrently, bounded by
//! `max_concurrency`; so do the remote fetches.  Decisions are folded into
//! the map by the driving task only.  A repository that could not be
//! decided (remote error, cancellation) is absent from the map, which
//! callers treat as a denial.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::cache::{PermsCache, UserAccessRecord, VisibilityRecord};
use super::registry::AuthnRegistry;
use super::types::{
    CodeHost, ExternalAccount, Identity, Perms, RemoteVisibility, Repo, RepoPerms, RepoRef, User,
    Visibility,
};
use crate::error::{AuthzError, CacheError};
use crate::forge::{CodeHostClient, IdentityMode};
use crate::metrics::{CacheLayer, CacheOp, LookupResult, Metrics, Outcome};
use crate::rcache::Cache;

/// Three hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct PermissionProviderBuilder {
    client: Arc<dyn CodeHostClient>,
    authn: Arc<AuthnRegistry>,
    cache: Cache,
    ttl: Duration,
    identity_mode: IdentityMode,
    require_identity: bool,
    max_concurrency: usize,
    bulk_list_threshold: Option<usize>,
    metrics: Option<Arc<Metrics>>,
}

impl PermissionProviderBuilder {
    /// Defaults to the no-op cache.
    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = cache;
        self
    }

    /// `Duration::ZERO` disables caching entirely.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn identity_mode(mut self, mode: IdentityMode) -> Self {
        self.identity_mode = mode;
        self
    }

    /// When set, a caller without an identity on the code host gets an
    /// empty decision map instead of public-only answers.
    pub fn require_identity(mut self, require: bool) -> Self {
        self.require_identity = require;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn bulk_list_threshold(mut self, threshold: Option<usize>) -> Self {
        self.bulk_list_threshold = threshold;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> PermissionProvider {
        PermissionProvider {
            client: self.client,
            authn: self.authn,
            cache: PermsCache::new(self.cache, self.ttl),
            identity_mode: self.identity_mode,
            require_identity: self.require_identity,
            max_concurrency: self.max_concurrency,
            bulk_list_threshold: self.bulk_list_threshold,
            metrics: self.metrics.unwrap_or_else(Metrics::unregistered),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct PermissionProvider {
    client: Arc<dyn CodeHostClient>,
    authn: Arc<AuthnRegistry>,
    cache: PermsCache,
    identity_mode: IdentityMode,
    require_identity: bool,
    max_concurrency: usize,
    bulk_list_threshold: Option<usize>,
    metrics: Arc<Metrics>,
}

/// Outcome of the cache stages for one repository.
enum Cached {
    Decided(bool),
    Undecided,
}

impl PermissionProvider {
    pub fn builder(
        client: Arc<dyn CodeHostClient>,
        authn: Arc<AuthnRegistry>,
    ) -> PermissionProviderBuilder {
        PermissionProviderBuilder {
            client,
            authn,
            cache: Cache::noop(),
            ttl: DEFAULT_TTL,
            identity_mode: IdentityMode::NativeUsername,
            require_identity: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            bulk_list_threshold: None,
            metrics: None,
        }
    }

    pub fn code_host(&self) -> &CodeHost {
        self.client.code_host()
    }

    pub fn service_id(&self) -> &str {
        &self.code_host().service_id
    }

    pub fn service_type(&self) -> &str {
        &self.code_host().service_type
    }

    /// The authentication provider identities are linked through, unless
    /// native usernames are used.
    pub fn authn_config_id(&self) -> Option<&str> {
        match &self.identity_mode {
            IdentityMode::NativeUsername => None,
            IdentityMode::LinkedAccount { authn_config_id } => Some(authn_config_id),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.cache.ttl()
    }

    /// Split `repos` into those hosted on this provider's code host and the
    /// rest.
    pub fn repos(&self, repos: &HashSet<Repo>) -> (HashSet<Repo>, HashSet<Repo>) {
        let host = self.code_host();
        repos.iter().cloned().partition(|r| host.owns(r))
    }

    /// Stage 1: the caller's account on this code host, if any.
    pub async fn fetch_account(
        &self,
        user: Option<&User>,
        accounts: &[ExternalAccount],
    ) -> Result<Option<Identity>, AuthzError> {
        self.client
            .resolve_identity(user, accounts, &self.identity_mode, &self.authn)
            .await
    }

    /// Stages 1 to 5.
    #[instrument(skip_all, fields(service_id = %self.service_id(), user_id = user.map(|u| u.id)))]
    pub async fn resolve(
        &self,
        user: Option<&User>,
        accounts: &[ExternalAccount],
        repos: &HashSet<Repo>,
        cancel: &CancellationToken,
    ) -> Result<RepoPerms, AuthzError> {
        let identity = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(undecided = repos.len(), "cancelled during identity resolution");
                return Ok(RepoPerms::new());
            }
            identity = self.fetch_account(user, accounts) => identity?,
        };
        if identity.is_none() && self.require_identity {
            debug!("no identity on code host and one is required");
            return Ok(RepoPerms::new());
        }
        self.repo_perms(identity.as_ref(), repos, cancel).await
    }

    /// Stages 2 to 5 for an already resolved identity (`None` for an
    /// anonymous caller).  Repositories not hosted here are ignored.
    #[instrument(
        skip_all,
        fields(
            service_id = %self.service_id(),
            account_id = identity.map(|i| i.account_id.as_str()),
            repos = repos.len(),
        )
    )]
    pub async fn repo_perms(
        &self,
        identity: Option<&Identity>,
        repos: &HashSet<Repo>,
        cancel: &CancellationToken,
    ) -> Result<RepoPerms, AuthzError> {
        let started = Instant::now();
        let (mine, _) = self.repos(repos);
        let refs = self.parse_repo_ids(mine)?;
        let total = refs.len();

        let mut perms = RepoPerms::with_capacity(total);
        let now = Utc::now();

        // Stages 2 and 3.
        let remaining = if self.cache.enabled() {
            let mut remaining = Vec::new();
            let lookups = stream::iter(refs)
                .map(|repo| async move {
                    let cached = self.cached_decision(identity, &repo, now).await;
                    (repo, cached)
                })
                .buffer_unordered(self.max_concurrency);
            let finished = drain(lookups, cancel, |(repo, cached)| match cached {
                Cached::Decided(read) => {
                    perms.insert(repo.name, Perms::read(read));
                }
                Cached::Undecided => remaining.push(repo),
            })
            .await;
            if !finished {
                warn!(
                    decided = perms.len(),
                    undecided = total - perms.len(),
                    "cancelled during cache lookups"
                );
                return Ok(perms);
            }
            remaining
        } else {
            refs
        };

        // Stage 4.
        if !remaining.is_empty() {
            let remaining = match self.bulk_candidate(identity, remaining.len()) {
                Some(identity) => {
                    match self
                        .decide_from_listing(identity, remaining, now, cancel, &mut perms)
                        .await
                    {
                        Ok(()) => Vec::new(),
                        Err(remaining) => remaining,
                    }
                }
                None => remaining,
            };
            self.fetch_remaining(identity, remaining, now, cancel, &mut perms)
                .await;
        }

        self.metrics
            .resolve_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        debug!(decided = perms.len(), total, "permissions resolved");
        Ok(perms)
    }

    /// Drop the cached visibility of one repository.  Its per-user records
    /// are only trusted under the visibility record they were written with,
    /// so none of them survive into the next one.
    pub async fn invalidate_repo(&self, repo_id: u64) -> Result<(), CacheError> {
        if !self.cache.enabled() {
            return Ok(());
        }
        self.cache.forget_repo(repo_id).await.inspect_err(|_| {
            self.metrics.cache_error(CacheOp::Delete);
        })?;
        info!(service_id = %self.service_id(), repo_id, "repository visibility invalidated");
        Ok(())
    }

    /// Operator clean-up: drop every record of this provider.
    pub async fn clear_cache(&self) -> Result<u64, CacheError> {
        self.cache.clear_all().await
    }

    // -- stages -----------------------------------------------------------

    /// External IDs must all parse before any cache or remote work starts.
    fn parse_repo_ids(&self, repos: HashSet<Repo>) -> Result<Vec<RepoRef>, AuthzError> {
        repos
            .into_iter()
            .map(|repo| match repo.external_id.trim().parse::<u64>() {
                Ok(id) => Ok(RepoRef {
                    id,
                    name: repo.name,
                }),
                Err(source) => Err(AuthzError::MalformedRepoId {
                    service_type: self.service_type().to_owned(),
                    id: repo.external_id,
                    source,
                }),
            })
            .collect()
    }

    async fn cached_decision(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
        now: DateTime<Utc>,
    ) -> Cached {
        let visibility = match self.cache.get_visibility(repo.id).await {
            Ok(Some(record)) if record.is_live(now) => {
                self.metrics.lookup(CacheLayer::Visibility, LookupResult::Hit);
                record
            }
            Ok(Some(_)) => {
                self.metrics.lookup(CacheLayer::Visibility, LookupResult::Stale);
                return Cached::Undecided;
            }
            Ok(None) => {
                self.metrics.lookup(CacheLayer::Visibility, LookupResult::Miss);
                return Cached::Undecided;
            }
            Err(err) => {
                self.cache_read_failed(repo.id, &err);
                return Cached::Undecided;
            }
        };

        let identity = match (visibility.visibility, identity) {
            (Visibility::Public, _) => return Cached::Decided(true),
            (Visibility::Internal, Some(_)) => return Cached::Decided(true),
            // Nothing but public repositories is readable without an
            // identity.
            (Visibility::Internal | Visibility::Private, None) => {
                return Cached::Decided(false)
            }
            (Visibility::Private, Some(identity)) => identity,
        };

        match self.cache.get_user_repo(&identity.account_id, repo.id).await {
            Ok(Some(record)) if record.is_live_under(&visibility, now) => {
                self.metrics.lookup(CacheLayer::UserRepo, LookupResult::Hit);
                Cached::Decided(record.can_read)
            }
            Ok(Some(_)) => {
                self.metrics.lookup(CacheLayer::UserRepo, LookupResult::Stale);
                Cached::Undecided
            }
            Ok(None) => {
                self.metrics.lookup(CacheLayer::UserRepo, LookupResult::Miss);
                Cached::Undecided
            }
            Err(err) => {
                self.cache_read_failed(repo.id, &err);
                Cached::Undecided
            }
        }
    }

    fn bulk_candidate<'a>(
        &self,
        identity: Option<&'a Identity>,
        remaining: usize,
    ) -> Option<&'a Identity> {
        let threshold = self.bulk_list_threshold?;
        let identity = identity?;
        (remaining >= threshold && self.client.supports_bulk_listing()).then_some(identity)
    }

    /// Decide every remaining repository from one accessible-repository
    /// listing.  Hands the repositories back if the listing fails.
    async fn decide_from_listing(
        &self,
        identity: &Identity,
        remaining: Vec<RepoRef>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        perms: &mut RepoPerms,
    ) -> Result<(), Vec<RepoRef>> {
        let listing = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(undecided = remaining.len(), "cancelled during repository listing");
                return Ok(());
            }
            listing = self.client.list_accessible_repos(identity) => listing,
        };
        let listing: HashMap<u64, RemoteVisibility> = match listing {
            Ok(listing) => {
                self.metrics.bulk_listing(self.service_id(), Outcome::Ok);
                listing.into_iter().map(|r| (r.id, r.access)).collect()
            }
            Err(err) => {
                self.metrics.bulk_listing(self.service_id(), Outcome::Error);
                warn!(
                    service_id = %self.service_id(),
                    error = format!("{err:#}"),
                    "repository listing failed, fetching one by one"
                );
                return Err(remaining);
            }
        };
        debug!(listed = listing.len(), candidates = remaining.len(), "deciding from listing");

        let writes = stream::iter(remaining)
            .map(|repo| {
                let access = listing
                    .get(&repo.id)
                    .copied()
                    .unwrap_or(RemoteVisibility::HIDDEN);
                async move {
                    let read = self.record(Some(identity), &repo, access, now).await;
                    (repo, read)
                }
            })
            .buffer_unordered(self.max_concurrency);
        // Decisions are already known, so they stand even if the cache
        // writes are cut short.
        drain(writes, cancel, |(repo, read)| {
            perms.insert(repo.name, Perms::read(read));
        })
        .await;
        Ok(())
    }

    async fn fetch_remaining(
        &self,
        identity: Option<&Identity>,
        remaining: Vec<RepoRef>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        perms: &mut RepoPerms,
    ) {
        if remaining.is_empty() {
            return;
        }
        let total = remaining.len();
        let mut done = 0usize;
        let fetches = stream::iter(remaining)
            .map(|repo| async move {
                let read = self.fetch_one(identity, &repo, now).await;
                (repo, read)
            })
            .buffer_unordered(self.max_concurrency);
        let finished = drain(fetches, cancel, |(repo, read)| {
            done += 1;
            if let Some(read) = read {
                perms.insert(repo.name, Perms::read(read));
            }
        })
        .await;
        if !finished {
            warn!(undecided = total - done, "cancelled during remote fetches");
        }
    }

    /// One remote fetch plus cache write-back.  `None` when the fetch
    /// failed; nothing is written then, so earlier records stay as they
    /// were.
    async fn fetch_one(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        match self.client.fetch_visibility(identity, repo).await {
            Ok(answer) => {
                self.metrics.remote_fetch(self.service_id(), Outcome::Ok);
                Some(self.record(identity, repo, answer, now).await)
            }
            Err(err) => {
                self.metrics.remote_fetch(self.service_id(), Outcome::Error);
                warn!(
                    repo_id = repo.id,
                    service_id = %self.service_id(),
                    error = format!("{err:#}"),
                    "failed to fetch repository visibility"
                );
                None
            }
        }
    }

    /// Write the records for a fresh answer and return its decision.  The
    /// visibility record is always written; the per-user record only for
    /// private repositories and only when there is an identity.
    async fn record(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
        answer: RemoteVisibility,
        now: DateTime<Utc>,
    ) -> bool {
        let read = answer.can_read();
        if !self.cache.enabled() {
            return read;
        }
        let expires_at = self.cache.expiry_from(now);

        let visibility = VisibilityRecord {
            repo_id: repo.id,
            visibility: answer.visibility,
            expires_at,
        };
        if let Err(err) = self.cache.set_visibility(&visibility).await {
            self.cache_write_failed(repo.id, &err);
        }

        if let (Visibility::Private, Some(identity)) = (answer.visibility, identity) {
            let user = UserAccessRecord {
                account_id: identity.account_id.clone(),
                repo_id: repo.id,
                can_read: read,
                expires_at,
                visibility_expires_at: expires_at,
            };
            if let Err(err) = self.cache.set_user_repo(&user).await {
                self.cache_write_failed(repo.id, &err);
            }
        }
        read
    }

    fn cache_read_failed(&self, repo_id: u64, err: &CacheError) {
        self.metrics.cache_error(CacheOp::Get);
        match err {
            CacheError::Codec(_) => {
                warn!(repo_id, error = %err, "corrupt permission cache entry, treating as miss")
            }
            CacheError::Transport(_) => {
                warn!(repo_id, error = %err, "permission cache unavailable, treating as miss")
            }
        }
    }

    fn cache_write_failed(&self, repo_id: u64, err: &CacheError) {
        self.metrics.cache_error(CacheOp::Set);
        warn!(repo_id, error = %err, "failed to write permission cache");
    }
}

/// Feed every item of `stream` to `fold` until the stream ends (`true`) or
/// `cancel` fires (`false`).  Pending futures in the stream are dropped on
/// cancellation.
async fn drain<S: Stream>(
    stream: S,
    cancel: &CancellationToken,
    mut fold: impl FnMut(S::Item),
) -> bool {
    tokio::pin!(stream);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            item = stream.next() => match item {
                Some(item) => fold(item),
                None => return true,
            },
        }
    }
}
