//! User registry: stable user id → bit offset mapping
//!
//! Allocation happens in the store through
//! [`BitmapStore::assign_offset`], which is atomic server-side. The local
//! cache only short-circuits repeat lookups; offsets are permanent, so a
//! cached entry can never go stale.

use super::traits::BitmapStore;
use crate::error::{Error, Result};
use crate::keys::KeyEncoder;
use crate::metrics;
use crate::types::UserOffset;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Default number of user offsets kept in the local cache
pub const DEFAULT_OFFSET_CACHE_CAPACITY: usize = 100_000;

/// Maps user identifiers to dense, never-reused bit offsets
pub struct UserRegistry {
    store: Arc<dyn BitmapStore>,
    users_key: String,
    counter_key: String,
    cache: DashMap<String, UserOffset>,
    cache_capacity: usize,
}

impl UserRegistry {
    /// Create a registry over `store` using the key names of `keys`
    pub fn new(store: Arc<dyn BitmapStore>, keys: &KeyEncoder) -> Self {
        Self::with_cache_capacity(store, keys, DEFAULT_OFFSET_CACHE_CAPACITY)
    }

    /// Create a registry whose cache holds at most `capacity` users
    ///
    /// A capacity of 0 disables caching.
    pub fn with_cache_capacity(
        store: Arc<dyn BitmapStore>,
        keys: &KeyEncoder,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            users_key: keys.users_key(),
            counter_key: keys.users_counter_key(),
            cache: DashMap::new(),
            cache_capacity: capacity,
        }
    }

    /// Offset of `user`, allocating the next free one on first sight
    ///
    /// Concurrent first lookups of the same user resolve to a single offset.
    pub async fn offset_for(&self, user: &str) -> Result<UserOffset> {
        validate_user(user)?;

        if let Some(offset) = self.cached(user) {
            return Ok(offset);
        }

        let assignment = self
            .store
            .assign_offset(&self.users_key, &self.counter_key, user)
            .await?;

        if assignment.created {
            metrics::record_user_allocated();
            debug!(user, offset = assignment.offset, "Allocated user offset");
        }

        self.remember(user, assignment.offset);
        Ok(assignment.offset)
    }

    /// Offset of `user` if one was ever allocated
    ///
    /// Never allocates.
    pub async fn lookup(&self, user: &str) -> Result<Option<UserOffset>> {
        validate_user(user)?;

        if let Some(offset) = self.cached(user) {
            return Ok(Some(offset));
        }

        let offset = self.store.lookup_offset(&self.users_key, user).await?;
        if let Some(offset) = offset {
            self.remember(user, offset);
        }
        Ok(offset)
    }

    /// Number of offsets allocated so far
    pub async fn user_count(&self) -> Result<u64> {
        Ok(self.store.counter(&self.counter_key).await?)
    }

    /// Number of users held in the local cache
    pub fn cached_users(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, user: &str) -> Option<UserOffset> {
        let hit = self.cache.get(user).map(|entry| *entry.value());
        metrics::record_offset_cache(hit.is_some());
        hit
    }

    fn remember(&self, user: &str, offset: UserOffset) {
        // Full cache: keep serving from the store rather than evicting
        if self.cache.len() < self.cache_capacity {
            self.cache.insert(user.to_string(), offset);
        }
    }
}

fn validate_user(user: &str) -> Result<()> {
    if user.is_empty() {
        return Err(Error::InvalidArgument("user id cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryStore;
    use std::sync::atomic::Ordering;

    fn registry_with_store() -> (Arc<InMemoryStore>, UserRegistry) {
        let store = Arc::new(InMemoryStore::new());
        let registry = UserRegistry::new(store.clone(), &KeyEncoder::default());
        (store, registry)
    }

    #[tokio::test]
    async fn test_offsets_start_at_zero_and_are_dense() {
        let (_, registry) = registry_with_store();

        assert_eq!(registry.offset_for("alice").await.unwrap(), 0);
        assert_eq!(registry.offset_for("bob").await.unwrap(), 1);
        assert_eq!(registry.offset_for("carol").await.unwrap(), 2);
        assert_eq!(registry.user_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_offset_for_is_idempotent() {
        let (store, registry) = registry_with_store();

        let first = registry.offset_for("alice").await.unwrap();
        let second = registry.offset_for("alice").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.counters().allocations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_empty_user_rejected() {
        let (store, registry) = registry_with_store();

        assert!(matches!(
            registry.offset_for("").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_never_allocates() {
        let (store, registry) = registry_with_store();

        assert_eq!(registry.lookup("ghost").await.unwrap(), None);
        assert_eq!(registry.user_count().await.unwrap(), 0);
        assert!(store.keys().is_empty());

        registry.offset_for("alice").await.unwrap();
        assert_eq!(registry.lookup("alice").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_registries_share_store_allocation() {
        let store = Arc::new(InMemoryStore::new());
        let keys = KeyEncoder::default();
        let a = UserRegistry::new(store.clone(), &keys);
        let b = UserRegistry::new(store.clone(), &keys);

        assert_eq!(a.offset_for("alice").await.unwrap(), 0);
        assert_eq!(b.offset_for("alice").await.unwrap(), 0);
        assert_eq!(b.offset_for("bob").await.unwrap(), 1);
        assert_eq!(a.offset_for("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let registry = UserRegistry::with_cache_capacity(store, &KeyEncoder::default(), 2);

        for user in ["a", "b", "c", "d"] {
            registry.offset_for(user).await.unwrap();
        }
        assert_eq!(registry.cached_users(), 2);

        // Uncached users still resolve through the store
        assert_eq!(registry.offset_for("d").await.unwrap(), 3);
    }
}
