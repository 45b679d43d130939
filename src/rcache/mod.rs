//! TTL-keyed byte cache shared by every permission provider.
//!
//! [`CacheStore`] is the raw store (KeyDB in production).  [`Cache`] is a
//! namespaced handle on top of it: every key is rewritten to
//! `{deployment}:{DATA_VERSION}:{component}:{key}` so that bumping
//! [`DATA_VERSION`] orphans everything written by older code without a
//! migration.

pub mod memory;
pub mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Bump when the shape of any cached value changes.  Old entries become
/// unreachable and age out through their TTL.
pub const DATA_VERSION: &str = "v1";

/// Longest TTL a store honours; longer ones are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// A shared byte store addressed by fully-qualified keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` when the key is absent.  Transport failures are errors,
    /// never misses.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace the value at `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix` and return how many went.
    ///
    /// This walks the whole keyspace.  It exists for tests and operator
    /// clean-up, not for invalidating single entries.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

/// Store that never holds anything.  Reads miss, writes are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl CacheStore for NoopStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Global prefix
// ---------------------------------------------------------------------------

/// Process-wide key prefix: deployment identifier plus data-format version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalPrefix(String);

impl GlobalPrefix {
    pub fn new(deployment_id: &str) -> Self {
        Self::with_version(deployment_id, DATA_VERSION)
    }

    pub fn with_version(deployment_id: &str, version: &str) -> Self {
        Self(format!("{deployment_id}:{version}"))
    }

    /// Resolve the deployment identifier the way the service does at
    /// startup: explicit value, then `FORGEPERM_DEPLOYMENT_ID`, then the
    /// hostname.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let deployment_id = explicit
            .map(str::to_owned)
            .or_else(|| std::env::var("FORGEPERM_DEPLOYMENT_ID").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        Self::new(&deployment_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Namespaced handle
// ---------------------------------------------------------------------------

/// A component's view of the shared store.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    namespace: String,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, global: &GlobalPrefix, component: &str) -> Self {
        Self {
            store,
            namespace: format!("{global}:{component}"),
        }
    }

    /// A cache that never hits.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopStore), &GlobalPrefix::new("noop"), "noop")
    }

    /// The key actually sent to the store.
    pub fn rkey(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.store.get(&self.rkey(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.store.set(&self.rkey(key), value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(&self.rkey(key)).await
    }

    /// Drop every entry of this component.  O(total keys); see
    /// [`CacheStore::clear_prefix`].
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        self.store.clear_prefix(&format!("{}:", self.namespace)).await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn rkey_layout() {
        let cache = Cache::new(
            Arc::new(NoopStore),
            &GlobalPrefix::new("sg.example.com"),
            "authz:gitlab",
        );
        assert_eq!(
            cache.rkey("repo-visibility:42"),
            "sg.example.com:v1:authz:gitlab:repo-visibility:42"
        );
    }

    #[test]
    fn resolve_prefers_explicit_deployment_id() {
        let prefix = GlobalPrefix::resolve(Some("prod-eu"));
        assert_eq!(prefix.as_str(), format!("prod-eu:{DATA_VERSION}"));
    }

    #[test]
    fn resolve_never_yields_empty_deployment() {
        let prefix = GlobalPrefix::resolve(Some(""));
        assert!(!prefix.as_str().starts_with(':'));
    }

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = Cache::noop();
        cache
            .set("k", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.clear_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn components_do_not_collide() {
        let store = store();
        let global = GlobalPrefix::new("test");
        let a = Cache::new(store.clone(), &global, "a");
        let b = Cache::new(store.clone(), &global, "b");

        a.set("k", b"from-a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
        assert_eq!(a.get("k").await.unwrap().as_deref(), Some(&b"from-a"[..]));
    }

    #[tokio::test]
    async fn version_bump_orphans_old_entries() {
        let store = store();
        let old = Cache::new(store.clone(), &GlobalPrefix::with_version("test", "v1"), "authz");
        let new = Cache::new(store.clone(), &GlobalPrefix::with_version("test", "v2"), "authz");

        old.set("repo-visibility:1", b"{}", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(old.get("repo-visibility:1").await.unwrap().is_some());
        assert_eq!(new.get("repo-visibility:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_all_only_touches_own_namespace() {
        let store = store();
        let global = GlobalPrefix::new("test");
        let mine = Cache::new(store.clone(), &global, "authz");
        let other = Cache::new(store.clone(), &global, "authz-other");

        mine.set("a", b"1", Duration::from_secs(60)).await.unwrap();
        mine.set("b", b"2", Duration::from_secs(60)).await.unwrap();
        other.set("a", b"3", Duration::from_secs(60)).await.unwrap();

        assert_eq!(mine.clear_all().await.unwrap(), 2);
        assert_eq!(mine.get("a").await.unwrap(), None);
        assert!(other.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_single_entry() {
        let cache = Cache::new(store(), &GlobalPrefix::new("test"), "authz");
        cache.set("a", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("b", b"2", Duration::from_secs(60)).await.unwrap();
        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.get("b").await.unwrap().is_some());
    }
}
