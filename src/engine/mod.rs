//! Analytics engine: registry, recorder and evaluator over a pluggable store
//!
//! [`Bitesized`] wires the components together around one shared
//! [`BitmapStore`] handle.
//!
//! # Example
//!
//! ```rust
//! use bitesized::engine::{memory::InMemoryStore, Bitesized};
//! use bitesized::types::BitOp;
//! use bitesized::interval::Granularity;
//! use chrono::Utc;
//!
//! # async fn example() -> bitesized::Result<()> {
//! let engine = Bitesized::builder().with_store(InMemoryStore::new()).build()?;
//!
//! let now = Utc::now();
//! engine.track("login", "alice", now).await?;
//!
//! let key = engine.event_key("login", now, Granularity::Day)?;
//! assert_eq!(engine.evaluate(BitOp::And, &[key]).await?, 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod query;
pub mod recorder;
pub mod registry;
pub mod traits;

pub use query::{QueryEvaluator, RetentionRow, RetentionTable, DEFAULT_SCRATCH_TTL};
pub use recorder::EventRecorder;
pub use registry::{UserRegistry, DEFAULT_OFFSET_CACHE_CAPACITY};
pub use traits::{BitmapStore, OffsetAssignment, WriteBatch};

use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::interval::{Granularity, IntervalCatalog};
use crate::keys::KeyEncoder;
use crate::redis::RedisBitmapStore;
use crate::types::{BitOp, BitValue, UserOffset};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builder for configuring the engine with a custom store
pub struct BitesizedBuilder {
    store: Option<Arc<dyn BitmapStore>>,
    catalog: IntervalCatalog,
    key_prefix: String,
    scratch_ttl: Option<Duration>,
    offset_cache_capacity: usize,
}

impl BitesizedBuilder {
    /// Create a builder with default settings and no store
    pub fn new() -> Self {
        let defaults = EngineConfig::default();
        Self {
            store: None,
            catalog: IntervalCatalog::default(),
            key_prefix: defaults.key_prefix,
            scratch_ttl: Some(DEFAULT_SCRATCH_TTL),
            offset_cache_capacity: DEFAULT_OFFSET_CACHE_CAPACITY,
        }
    }

    /// Set the store implementation
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: BitmapStore,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the store from an existing Arc
    ///
    /// Use this to keep a handle on the store for direct inspection.
    pub fn with_store_arc(mut self, store: Arc<dyn BitmapStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the tracked intervals
    pub fn with_intervals(mut self, catalog: IntervalCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Set the key namespace prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the scratch key TTL; `None` disables expiry
    pub fn with_scratch_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.scratch_ttl = ttl;
        self
    }

    /// Set how many user offsets are cached locally
    pub fn with_offset_cache_capacity(mut self, capacity: usize) -> Self {
        self.offset_cache_capacity = capacity;
        self
    }

    /// Apply the engine section of a configuration
    pub fn with_config(mut self, config: &EngineConfig) -> Result<Self> {
        self.catalog = config.catalog()?;
        self.key_prefix = config.key_prefix.clone();
        self.scratch_ttl = config.scratch_ttl();
        self.offset_cache_capacity = config.offset_cache_capacity;
        Ok(self)
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when no store is set, the prefix is invalid or
    /// the interval catalog is empty.
    pub fn build(self) -> Result<Bitesized> {
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("No store configured".to_string()))?;

        let keys = KeyEncoder::new(self.key_prefix)?;
        let registry = Arc::new(UserRegistry::with_cache_capacity(
            Arc::clone(&store),
            &keys,
            self.offset_cache_capacity,
        ));
        let recorder = EventRecorder::new(
            Arc::clone(&store),
            self.catalog,
            keys.clone(),
            Arc::clone(&registry),
        )?;
        let evaluator = QueryEvaluator::new(Arc::clone(&store), keys.clone(), Arc::clone(&registry))
            .with_scratch_ttl(self.scratch_ttl);

        Ok(Bitesized {
            store,
            keys,
            registry,
            recorder,
            evaluator,
        })
    }
}

impl Default for BitesizedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitmap analytics engine
///
/// Cheap to share behind an `Arc`; every method takes `&self` and holds no
/// lock across store round-trips.
pub struct Bitesized {
    store: Arc<dyn BitmapStore>,
    keys: KeyEncoder,
    registry: Arc<UserRegistry>,
    recorder: EventRecorder,
    evaluator: QueryEvaluator,
}

impl Bitesized {
    /// Start configuring an engine
    pub fn builder() -> BitesizedBuilder {
        BitesizedBuilder::new()
    }

    /// Connect to Redis and build an engine from a full configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;

        let store = RedisBitmapStore::new(config.redis.to_redis_config()).await?;
        info!(
            prefix = %config.engine.key_prefix,
            intervals = config.engine.intervals.len(),
            "Connected to Redis"
        );

        Self::builder()
            .with_store(store)
            .with_config(&config.engine)?
            .build()
    }

    /// Store backing this engine
    pub fn store(&self) -> &Arc<dyn BitmapStore> {
        &self.store
    }

    /// Key encoder in use
    pub fn keys(&self) -> &KeyEncoder {
        &self.keys
    }

    /// Tracked intervals
    pub fn intervals(&self) -> &IntervalCatalog {
        self.recorder.catalog()
    }

    /// User registry
    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Record that `user` triggered `event` at `at` in every tracked interval
    pub async fn track(&self, event: &str, user: &str, at: DateTime<Utc>) -> Result<()> {
        self.recorder.track(event, user, at).await
    }

    /// Clear `user` from the `event` buckets containing `at`
    pub async fn untrack(&self, event: &str, user: &str, at: DateTime<Utc>) -> Result<()> {
        self.recorder.untrack(event, user, at).await
    }

    /// Write an explicit bit value for `user` in every tracked interval
    pub async fn record(
        &self,
        event: &str,
        user: &str,
        at: DateTime<Utc>,
        value: impl Into<BitValue>,
    ) -> Result<()> {
        self.recorder.record(event, user, at, value).await
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Count users selected by `op` across `keys`
    pub async fn evaluate(&self, op: BitOp, keys: &[String]) -> Result<u64> {
        self.evaluator.evaluate(op, keys).await
    }

    /// Keep the result of `op` across `keys` under `dest` and count it
    ///
    /// See [`QueryEvaluator::combine_into`].
    pub async fn combine_into(
        &self,
        op: BitOp,
        dest: &str,
        keys: &[String],
        ttl: Option<Duration>,
    ) -> Result<u64> {
        self.evaluator.combine_into(op, dest, keys, ttl).await
    }

    /// Users who triggered `event` in the `granularity` bucket containing `at`
    pub async fn count(
        &self,
        event: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<u64> {
        self.evaluator.count(event, at, granularity).await
    }

    /// Whether `user` triggered `event` in the `granularity` bucket containing `at`
    pub async fn did_event(
        &self,
        event: &str,
        user: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<bool> {
        self.evaluator.did_event(event, user, at, granularity).await
    }

    /// Cohort retention table of `event` between `from` and `till`
    pub async fn retention(
        &self,
        event: &str,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<RetentionTable> {
        self.evaluator.retention(event, from, till, granularity).await
    }

    /// Key of the `event` bitmap for the `granularity` bucket containing `at`
    ///
    /// Any granularity can be encoded, but only tracked ones hold data.
    pub fn event_key(
        &self,
        event: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<String> {
        self.keys.event_key(event, at, granularity)
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Offset of `user`, allocating one if needed
    pub async fn offset_for(&self, user: &str) -> Result<UserOffset> {
        self.registry.offset_for(user).await
    }

    /// Offset of `user` if one was ever allocated
    pub async fn lookup_user(&self, user: &str) -> Result<Option<UserOffset>> {
        self.registry.lookup(user).await
    }

    /// Number of users ever seen
    pub async fn user_count(&self) -> Result<u64> {
        self.registry.user_count().await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete scratch keys left by interrupted evaluations
    pub async fn scavenge_scratch_keys(&self) -> Result<usize> {
        self.evaluator.scavenge_scratch_keys().await
    }
}
