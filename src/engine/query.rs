//! Set-algebra query evaluation
//!
//! Every evaluation combines its operands into a fresh scratch key, counts
//! the set bits and deletes the scratch key again. The delete runs on every
//! exit path; scratch keys also carry a TTL so a crash between combine and
//! delete leaves nothing permanent behind.
//!
//! Operands follow the store's bitmap semantics: absent keys are empty,
//! shorter bitmaps are zero-extended, and `NOT` inverts whole bytes, so its
//! count includes the padding bits past the highest allocated offset.

use super::registry::UserRegistry;
use super::traits::BitmapStore;
use crate::error::{Error, Result, StoreError};
use crate::interval::Granularity;
use crate::keys::KeyEncoder;
use crate::metrics;
use crate::types::BitOp;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default lifetime of a scratch key
pub const DEFAULT_SCRATCH_TTL: Duration = Duration::from_secs(60);

/// Upper bound on buckets in one retention table
pub const MAX_RETENTION_BUCKETS: usize = 512;

/// One cohort of a retention table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionRow {
    /// Start of the cohort's bucket
    pub bucket: DateTime<Utc>,
    /// Bucket label, e.g. `day:2024-03-09`
    pub label: String,
    /// `retained[0]` is the cohort size; `retained[k]` counts cohort users
    /// who also triggered the event `k` buckets later
    pub retained: Vec<u64>,
}

impl RetentionRow {
    /// Users in the cohort bucket
    pub fn cohort_size(&self) -> u64 {
        self.retained.first().copied().unwrap_or(0)
    }
}

/// Triangular cohort table produced by [`QueryEvaluator::retention`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionTable {
    /// Bucket size of every row
    pub granularity: Granularity,
    /// One row per bucket, oldest first
    pub rows: Vec<RetentionRow>,
}

/// Evaluates set-algebra queries over event bitmaps
pub struct QueryEvaluator {
    store: Arc<dyn BitmapStore>,
    keys: KeyEncoder,
    registry: Arc<UserRegistry>,
    scratch_ttl: Option<Duration>,
}

impl QueryEvaluator {
    /// Create an evaluator whose scratch keys expire after [`DEFAULT_SCRATCH_TTL`]
    pub fn new(store: Arc<dyn BitmapStore>, keys: KeyEncoder, registry: Arc<UserRegistry>) -> Self {
        Self {
            store,
            keys,
            registry,
            scratch_ttl: Some(DEFAULT_SCRATCH_TTL),
        }
    }

    /// Override the scratch key TTL; `None` disables expiry
    pub fn with_scratch_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.scratch_ttl = ttl;
        self
    }

    /// Key encoder used for operands and scratch keys
    pub fn keys(&self) -> &KeyEncoder {
        &self.keys
    }

    /// Count the users selected by applying `op` across `keys`
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOperandCount`] when `NOT` gets anything but one key,
    ///   or `AND`/`OR`/`XOR` get none
    /// - [`Error::InvalidArgument`] for an empty key
    /// - Store errors are returned as-is, never as a zero count
    pub async fn evaluate(&self, op: BitOp, keys: &[String]) -> Result<u64> {
        op.check_arity(keys.len())?;
        if keys.iter().any(|k| k.is_empty()) {
            return Err(Error::InvalidArgument("operand key cannot be empty".to_string()));
        }

        let start = Instant::now();
        let scratch = self.keys.scratch_key();

        let result = self.combine_and_count(op, &scratch, keys, self.scratch_ttl).await;
        self.release_scratch(scratch, &result).await;

        metrics::record_query(op.as_str(), start.elapsed().as_secs_f64(), result.is_ok());

        match result {
            Ok(count) => {
                debug!(
                    op = op.as_str(),
                    operands = keys.len(),
                    count,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "Evaluated query"
                );
                Ok(count)
            },
            Err(e) => {
                let err = Error::from(e);
                metrics::record_error(err.kind(), "evaluate");
                Err(err)
            },
        }
    }

    /// Store the result of `op` across `keys` under `dest` and count it
    ///
    /// Unlike [`evaluate`](Self::evaluate) the combined bitmap is kept, so it
    /// can feed a later query: `NOT purchase` into `dest`, then
    /// `AND login dest`. The caller owns `dest` and deletes it when done;
    /// with a `ttl` it also expires on its own. An empty result leaves no
    /// key behind.
    ///
    /// # Errors
    ///
    /// Same as `evaluate`, plus [`Error::InvalidArgument`] when `dest` is
    /// empty or names an event bitmap or the user registry.
    pub async fn combine_into(
        &self,
        op: BitOp,
        dest: &str,
        keys: &[String],
        ttl: Option<Duration>,
    ) -> Result<u64> {
        op.check_arity(keys.len())?;
        if keys.iter().any(|k| k.is_empty()) {
            return Err(Error::InvalidArgument("operand key cannot be empty".to_string()));
        }
        if dest.is_empty() {
            return Err(Error::InvalidArgument("destination key cannot be empty".to_string()));
        }
        if self.keys.is_engine_key(dest) {
            return Err(Error::InvalidArgument(format!(
                "destination '{}' would overwrite engine data",
                dest
            )));
        }

        let start = Instant::now();
        let result = self.combine_and_count(op, dest, keys, ttl).await;
        metrics::record_query(op.as_str(), start.elapsed().as_secs_f64(), result.is_ok());

        match result {
            Ok(count) => {
                debug!(op = op.as_str(), dest, operands = keys.len(), count, "Stored combined bitmap");
                Ok(count)
            },
            Err(e) => {
                let err = Error::from(e);
                metrics::record_error(err.kind(), "combine_into");
                Err(err)
            },
        }
    }

    async fn combine_and_count(
        &self,
        op: BitOp,
        dest: &str,
        keys: &[String],
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError> {
        self.store.bit_op(op, dest, keys, ttl).await?;
        self.store.bit_count(dest).await
    }

    /// Delete the scratch key, whatever happened before
    ///
    /// After a timeout the store may still be stalled, so the delete runs in
    /// the background instead of holding up the error.
    async fn release_scratch(&self, scratch: String, outcome: &std::result::Result<u64, StoreError>) {
        if matches!(outcome, Err(StoreError::Timeout(_))) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    delete_scratch(store.as_ref(), &scratch).await;
                });
                return;
            }
        }
        delete_scratch(self.store.as_ref(), &scratch).await;
    }

    /// Set bits in one bucket of `event`
    pub async fn count(
        &self,
        event: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<u64> {
        let key = self.keys.event_key(event, at, granularity)?;
        Ok(self.store.bit_count(&key).await?)
    }

    /// Whether `user` triggered `event` in the `granularity` bucket containing `at`
    ///
    /// Unknown users yield `false` without being allocated an offset.
    pub async fn did_event(
        &self,
        event: &str,
        user: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<bool> {
        let key = self.keys.event_key(event, at, granularity)?;
        match self.registry.lookup(user).await? {
            Some(offset) => Ok(self.store.get_bit(&key, offset).await?.is_set()),
            None => Ok(false),
        }
    }

    /// Cohort retention of `event` between `from` and `till`
    ///
    /// Row `i` is the cohort of bucket `i`; its `retained[k]` is the size of
    /// `bucket[i] AND bucket[i + k]`.
    pub async fn retention(
        &self,
        event: &str,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<RetentionTable> {
        let buckets = granularity.buckets_between(from, till, MAX_RETENTION_BUCKETS)?;

        let keys = buckets
            .iter()
            .map(|b| self.keys.event_key(event, *b, granularity))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::with_capacity(buckets.len());
        for (i, bucket) in buckets.iter().enumerate() {
            let cohort = &keys[i];
            let mut retained = Vec::with_capacity(keys.len() - i);
            retained.push(self.store.bit_count(cohort).await?);

            let pairs = keys[i + 1..].iter().map(|later| {
                let pair = [cohort.clone(), later.clone()];
                async move { self.evaluate(BitOp::And, &pair).await }
            });
            retained.extend(try_join_all(pairs).await?);

            rows.push(RetentionRow {
                bucket: *bucket,
                label: granularity.label(*bucket),
                retained,
            });
        }

        Ok(RetentionTable { granularity, rows })
    }

    /// Delete scratch keys left behind by interrupted evaluations
    ///
    /// Returns the number of keys removed. Only safe to run while no
    /// evaluation is in flight, since live scratch keys match as well.
    pub async fn scavenge_scratch_keys(&self) -> Result<usize> {
        let namespace = self.keys.scratch_namespace();
        let stray = self.store.keys_with_prefix(&namespace).await?;

        let mut removed = 0;
        for key in &stray {
            if self.store.delete(key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            metrics::record_scratch_scavenged(removed);
            info!(removed, "Removed stray scratch keys");
        }
        Ok(removed)
    }
}

async fn delete_scratch(store: &dyn BitmapStore, scratch: &str) {
    if let Err(e) = store.delete(scratch).await {
        metrics::record_scratch_cleanup_failure();
        warn!(
            scratch,
            error = %e,
            "Failed to delete scratch key; it expires on its own if a TTL is set"
        );
    }
}
