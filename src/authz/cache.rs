//! The two cache layers of the permission pipeline.
//!
//! * `repo-visibility:{repo_id}` → [`VisibilityRecord`], shared by every
//!   identity.
//! * `user-repo:{account_id}:{repo_id}` → [`UserAccessRecord`], written
//!   only for private repositories.
//!
//! Records carry their own `expires_at` in addition to the store TTL; a
//! record past `expires_at` is a miss even if the store still returns it.
//! A user-access record also names the visibility record it was written
//! alongside, and is only trusted while that exact record is the live one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::types::Visibility;
use crate::error::CacheError;
use crate::rcache::Cache;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityRecord {
    pub repo_id: u64,
    pub visibility: Visibility,
    pub expires_at: DateTime<Utc>,
}

impl VisibilityRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccessRecord {
    pub account_id: String,
    pub repo_id: u64,
    pub can_read: bool,
    pub expires_at: DateTime<Utc>,
    /// `expires_at` of the visibility record written with this one.
    /// Missing in older entries, which then never match.
    #[serde(default)]
    pub visibility_expires_at: DateTime<Utc>,
}

impl UserAccessRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Live, and written together with `visibility`.  A visibility record
    /// rewritten since (after an invalidation, say) orphans this one.
    pub fn is_live_under(&self, visibility: &VisibilityRecord, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.visibility_expires_at == visibility.expires_at
    }
}

fn visibility_key(repo_id: u64) -> String {
    format!("repo-visibility:{repo_id}")
}

fn user_repo_key(account_id: &str, repo_id: u64) -> String {
    format!("user-repo:{account_id}:{repo_id}")
}

/// Typed access to the visibility and user-access records of one code host.
#[derive(Debug, Clone)]
pub struct PermsCache {
    cache: Cache,
    ttl: Duration,
}

impl PermsCache {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A zero TTL means "never trust the cache": nothing is read or written.
    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// `expires_at` for a record written now.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn get_visibility(
        &self,
        repo_id: u64,
    ) -> Result<Option<VisibilityRecord>, CacheError> {
        self.get_json(&visibility_key(repo_id)).await
    }

    pub async fn set_visibility(&self, record: &VisibilityRecord) -> Result<(), CacheError> {
        self.set_json(&visibility_key(record.repo_id), record).await
    }

    pub async fn get_user_repo(
        &self,
        account_id: &str,
        repo_id: u64,
    ) -> Result<Option<UserAccessRecord>, CacheError> {
        self.get_json(&user_repo_key(account_id, repo_id)).await
    }

    pub async fn set_user_repo(&self, record: &UserAccessRecord) -> Result<(), CacheError> {
        self.set_json(&user_repo_key(&record.account_id, record.repo_id), record)
            .await
    }

    /// Drop the visibility record of one repository.  Per-user records for
    /// it are orphaned too: whatever visibility record is written next has
    /// a different `expires_at` from the one they were written under.
    pub async fn forget_repo(&self, repo_id: u64) -> Result<(), CacheError> {
        self.cache.delete(&visibility_key(repo_id)).await
    }

    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        self.cache.clear_all().await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self.cache.get(key).await? else {
            trace!(key, "authz cache miss");
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)?;
        trace!(key, "authz cache hit");
        Ok(Some(value))
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.cache.set(key, &bytes, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::rcache::memory::MemoryStore;
    use crate::rcache::GlobalPrefix;

    fn perms_cache(store: Arc<MemoryStore>, ttl: Duration) -> PermsCache {
        PermsCache::new(
            Cache::new(store, &GlobalPrefix::new("test"), "authz:gitlab"),
            ttl,
        )
    }

    #[test]
    fn key_shapes() {
        assert_eq!(visibility_key(42), "repo-visibility:42");
        assert_eq!(user_repo_key("U1", 7), "user-repo:U1:7");
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let cache = perms_cache(Arc::new(MemoryStore::new()), Duration::ZERO);
        assert!(!cache.enabled());
    }

    #[test]
    fn liveness_is_strict() {
        let now = Utc::now();
        let record = VisibilityRecord {
            repo_id: 1,
            visibility: Visibility::Public,
            expires_at: now,
        };
        assert!(!record.is_live(now));
        assert!(record.is_live(now - chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn records_land_under_expected_keys() {
        let store = Arc::new(MemoryStore::new());
        let cache = perms_cache(store.clone(), Duration::from_secs(3600));
        let now = Utc::now();

        cache
            .set_visibility(&VisibilityRecord {
                repo_id: 7,
                visibility: Visibility::Private,
                expires_at: cache.expiry_from(now),
            })
            .await
            .unwrap();
        cache
            .set_user_repo(&UserAccessRecord {
                account_id: "U1".into(),
                repo_id: 7,
                can_read: false,
                expires_at: cache.expiry_from(now),
                visibility_expires_at: cache.expiry_from(now),
            })
            .await
            .unwrap();

        assert_eq!(
            store.keys(),
            vec![
                "test:v1:authz:gitlab:repo-visibility:7".to_string(),
                "test:v1:authz:gitlab:user-repo:U1:7".to_string(),
            ]
        );
        let user = cache.get_user_repo("U1", 7).await.unwrap().unwrap();
        assert!(!user.can_read);
        assert!(user.is_live(now));
    }

    #[tokio::test]
    async fn corrupt_entry_is_codec_error() {
        let store = Arc::new(MemoryStore::new());
        let cache = perms_cache(store.clone(), Duration::from_secs(60));
        crate::rcache::CacheStore::set(
            store.as_ref(),
            "test:v1:authz:gitlab:repo-visibility:3",
            b"not json",
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let err = cache.get_visibility(3).await.unwrap_err();
        assert!(matches!(err, CacheError::Codec(_)));
    }

    #[tokio::test]
    async fn forget_repo_removes_visibility() {
        let store = Arc::new(MemoryStore::new());
        let cache = perms_cache(store, Duration::from_secs(60));
        cache
            .set_visibility(&VisibilityRecord {
                repo_id: 9,
                visibility: Visibility::Public,
                expires_at: cache.expiry_from(Utc::now()),
            })
            .await
            .unwrap();
        cache.forget_repo(9).await.unwrap();
        assert_eq!(cache.get_visibility(9).await.unwrap(), None);
    }

    #[test]
    fn user_record_only_trusted_under_its_own_visibility_record() {
        let now = Utc::now();
        let written = VisibilityRecord {
            repo_id: 7,
            visibility: Visibility::Private,
            expires_at: now + chrono::Duration::hours(1),
        };
        let user = UserAccessRecord {
            account_id: "U1".into(),
            repo_id: 7,
            can_read: true,
            expires_at: written.expires_at,
            visibility_expires_at: written.expires_at,
        };
        assert!(user.is_live_under(&written, now));

        let rewritten = VisibilityRecord {
            expires_at: written.expires_at + chrono::Duration::seconds(5),
            ..written.clone()
        };
        assert!(!user.is_live_under(&rewritten, now));
    }

    #[test]
    fn user_record_without_visibility_link_never_matches() {
        let raw = serde_json::json!({
            "account_id": "U1",
            "repo_id": 7,
            "can_read": true,
            "expires_at": "2999-01-01T00:00:00Z",
        });
        let user: UserAccessRecord = serde_json::from_value(raw).unwrap();
        let visibility = VisibilityRecord {
            repo_id: 7,
            visibility: Visibility::Private,
            expires_at: user.expires_at,
        };
        assert!(!user.is_live_under(&visibility, Utc::now()));
    }

    #[test]
    fn expiry_saturates_for_huge_ttl() {
        let cache = perms_cache(Arc::new(MemoryStore::new()), Duration::MAX);
        assert_eq!(cache.expiry_from(Utc::now()), DateTime::<Utc>::MAX_UTC);
    }
}
