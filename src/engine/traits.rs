//! Store adapter trait: the narrow surface the engine needs from a
//! bit-addressable key-value store

use crate::error::StoreError;
use crate::types::{BitOp, BitValue, UserOffset};
use async_trait::async_trait;
use std::time::Duration;

// =============================================================================
// Write batches
// =============================================================================

/// A single bit write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitWrite {
    /// Bitmap key
    pub key: String,
    /// Bit position
    pub offset: UserOffset,
    /// Value to write
    pub value: BitValue,
}

/// Group of bit writes executed as one logical operation
///
/// Stores that report [`BitmapStore::is_atomic_batch`] apply the whole batch
/// or nothing. Other stores apply it in order and report how far they got.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    writes: Vec<BitWrite>,
}

impl WriteBatch {
    /// Start an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty batch with room for `n` writes
    pub fn with_capacity(n: usize) -> Self {
        Self {
            writes: Vec::with_capacity(n),
        }
    }

    /// Queue a bit write
    pub fn set_bit(&mut self, key: impl Into<String>, offset: UserOffset, value: BitValue) {
        self.writes.push(BitWrite {
            key: key.into(),
            offset,
            value,
        });
    }

    /// Queued writes
    pub fn writes(&self) -> &[BitWrite] {
        &self.writes
    }

    /// Consume the batch
    pub fn into_writes(self) -> Vec<BitWrite> {
        self.writes
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Result of a get-or-allocate offset lookup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffsetAssignment {
    /// Offset owned by the user
    pub offset: UserOffset,
    /// True when this call allocated the offset
    pub created: bool,
}

// =============================================================================
// BitmapStore Trait
// =============================================================================

/// Core trait for bitmap store backends
///
/// Absent keys behave as empty bitmaps: they count zero set bits, read as 0
/// at every offset and are zero-extended by `bit_op`.
#[async_trait]
pub trait BitmapStore: Send + Sync + 'static {
    /// Unique identifier for this store backend
    fn store_id(&self) -> &str;

    /// Whether [`exec_batch`](Self::exec_batch) is all-or-nothing
    fn is_atomic_batch(&self) -> bool {
        false
    }

    /// Write one bit, returning the previous value
    async fn set_bit(
        &self,
        key: &str,
        offset: UserOffset,
        value: BitValue,
    ) -> Result<BitValue, StoreError>;

    /// Read one bit
    async fn get_bit(&self, key: &str, offset: UserOffset) -> Result<BitValue, StoreError>;

    /// Count set bits
    async fn bit_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Combine `sources` with `op` into `dest`, returning the result length in bytes
    ///
    /// When `ttl` is given the destination expires after it.
    async fn bit_op(
        &self,
        op: BitOp,
        dest: &str,
        sources: &[String],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Remove a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Execute a batch of bit writes
    ///
    /// The default applies writes one at a time; see [`exec_sequential`].
    async fn exec_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        exec_sequential(self, batch).await
    }

    /// Return the user's offset, allocating the next one atomically if absent
    async fn assign_offset(
        &self,
        users_key: &str,
        counter_key: &str,
        user: &str,
    ) -> Result<OffsetAssignment, StoreError>;

    /// Return the user's offset without allocating
    async fn lookup_offset(
        &self,
        users_key: &str,
        user: &str,
    ) -> Result<Option<UserOffset>, StoreError>;

    /// Number of offsets allocated so far
    async fn counter(&self, counter_key: &str) -> Result<u64, StoreError>;

    /// Keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Apply a batch write by write, reporting how many landed on failure
///
/// A failure on the first write is returned as-is since nothing was applied;
/// later failures become [`StoreError::PartialWrite`].
pub async fn exec_sequential<S>(store: &S, batch: WriteBatch) -> Result<(), StoreError>
where
    S: BitmapStore + ?Sized,
{
    let total = batch.len();
    for (applied, write) in batch.into_writes().into_iter().enumerate() {
        if let Err(e) = store.set_bit(&write.key, write.offset, write.value).await {
            if applied == 0 {
                return Err(e);
            }
            return Err(StoreError::PartialWrite {
                applied,
                total,
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch() {
        let mut batch = WriteBatch::with_capacity(2);
        assert!(batch.is_empty());

        batch.set_bit("a", 3, BitValue::Set);
        batch.set_bit(String::from("b"), 7, BitValue::Clear);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.writes()[0].key, "a");
        assert_eq!(batch.writes()[1].value, BitValue::Clear);

        let writes = batch.into_writes();
        assert_eq!(writes[1].offset, 7);
    }
}
