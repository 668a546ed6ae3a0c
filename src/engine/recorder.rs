//! Event recorder
//!
//! One `record` call sets (or clears) the user's bit in the bucket of every
//! configured granularity. All writes of a call go to the store as a single
//! [`WriteBatch`].

use super::registry::UserRegistry;
use super::traits::{BitmapStore, WriteBatch};
use crate::error::{Error, Result};
use crate::interval::IntervalCatalog;
use crate::keys::KeyEncoder;
use crate::metrics;
use crate::types::BitValue;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Writes user events into per-interval bitmaps
pub struct EventRecorder {
    store: Arc<dyn BitmapStore>,
    catalog: IntervalCatalog,
    keys: KeyEncoder,
    registry: Arc<UserRegistry>,
}

impl EventRecorder {
    /// Create a recorder
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the catalog is empty.
    pub fn new(
        store: Arc<dyn BitmapStore>,
        catalog: IntervalCatalog,
        keys: KeyEncoder,
        registry: Arc<UserRegistry>,
    ) -> Result<Self> {
        if catalog.is_empty() {
            return Err(Error::Configuration(
                "interval catalog cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            store,
            catalog,
            keys,
            registry,
        })
    }

    /// Intervals written by every record call
    pub fn catalog(&self) -> &IntervalCatalog {
        &self.catalog
    }

    /// Keys a record of `event` at `at` touches, in catalog order
    pub fn event_keys(&self, event: &str, at: DateTime<Utc>) -> Result<Vec<String>> {
        self.catalog
            .labels(at)
            .iter()
            .map(|(_, label)| self.keys.encode(event, label))
            .collect()
    }

    /// Record that `user` triggered `event` at `at`
    pub async fn track(&self, event: &str, user: &str, at: DateTime<Utc>) -> Result<()> {
        self.record(event, user, at, BitValue::Set).await
    }

    /// Remove `user` from the `event` buckets containing `at`
    pub async fn untrack(&self, event: &str, user: &str, at: DateTime<Utc>) -> Result<()> {
        self.record(event, user, at, BitValue::Clear).await
    }

    /// Write `value` at the user's offset in every interval bucket of `event`
    ///
    /// `value` is a [`BitValue`] or a plain `bool`.
    ///
    /// Arguments are validated before anything is written, offset allocation
    /// included. Re-recording the same value is a no-op, so a call that
    /// failed with [`Error::PartialWrite`] can simply be repeated.
    pub async fn record(
        &self,
        event: &str,
        user: &str,
        at: DateTime<Utc>,
        value: impl Into<BitValue>,
    ) -> Result<()> {
        let value = value.into();
        if user.is_empty() {
            return Err(Error::InvalidArgument("user id cannot be empty".to_string()));
        }
        let keys = self.event_keys(event, at)?;

        let offset = self.registry.offset_for(user).await?;

        let mut batch = WriteBatch::with_capacity(keys.len());
        for key in keys {
            batch.set_bit(key, offset, value);
        }
        let total = batch.len();

        match self.store.exec_batch(batch).await {
            Ok(()) => {
                metrics::record_event(value.is_set(), "success");
                debug!(event, user, offset, writes = total, "Recorded event");
                Ok(())
            },
            Err(e) => {
                let err = Error::from(e);
                if let Error::PartialWrite { applied, total } = &err {
                    metrics::record_partial_write();
                    metrics::record_event(value.is_set(), "partial");
                    warn!(
                        event,
                        user,
                        applied,
                        total,
                        "Event recorded in some intervals only; retry the call"
                    );
                } else {
                    metrics::record_event(value.is_set(), "error");
                }
                metrics::record_error(err.kind(), "record");
                Err(err)
            },
        }
    }
}
