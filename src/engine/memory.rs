//! In-memory bitmap store
//!
//! A lightweight alternative to Redis for tests and development. It follows
//! Redis bitmap semantics closely enough for the engine's contracts:
//!
//! - bit N lives in byte N/8, most significant bit first
//! - absent keys are empty bitmaps
//! - `BITOP` zero-extends shorter operands to the longest one
//! - `BITOP NOT` inverts whole bytes of its single operand
//! - a `BITOP` with an empty result deletes the destination
//! - operations on a key of another type fail with `WRONGTYPE`
//!
//! # Warning
//!
//! Nothing is persisted; all data is lost on drop.
//!
//! # Failure injection
//!
//! [`FailurePlan`] makes selected operations fail, which lets tests exercise
//! partial writes and scratch-key cleanup.

use super::traits::{exec_sequential, BitmapStore, OffsetAssignment, WriteBatch};
use crate::error::StoreError;
use crate::types::{BitOp, BitValue, UserOffset};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const OFFSET_OUT_OF_RANGE: &str = "ERR bit offset is not an integer or out of range";

/// First offset past the largest bitmap Redis accepts (512 MiB)
const BIT_OFFSET_LIMIT: UserOffset = 1 << 32;

fn check_offset(offset: UserOffset) -> Result<(), StoreError> {
    if offset >= BIT_OFFSET_LIMIT {
        return Err(StoreError::Response(OFFSET_OUT_OF_RANGE.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum Value {
    Bitmap(Vec<u8>),
    Hash(HashMap<String, u64>),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Operations that can be made to fail
#[derive(Debug, Default)]
pub struct FailurePlan {
    /// Fail every `set_bit` after this many have succeeded
    pub set_bit_after: Option<usize>,
    /// Fail the next `bit_count` with this error
    pub next_bit_count: Option<StoreError>,
    /// Fail the next `bit_op` with this error
    pub next_bit_op: Option<StoreError>,
    /// Fail every `delete`
    pub delete: Option<StoreError>,
}

/// Operation counters, useful for asserting that no writes happened
#[derive(Debug, Default)]
pub struct StoreCounters {
    /// Successful `set_bit` calls, including those inside batches
    pub bit_writes: AtomicU64,
    /// `bit_op` calls
    pub bit_ops: AtomicU64,
    /// `delete` calls
    pub deletes: AtomicU64,
    /// Offsets allocated
    pub allocations: AtomicU64,
}

/// In-memory [`BitmapStore`]
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    atomic_batches: bool,
    failures: Mutex<FailurePlan>,
    set_bits_done: AtomicU64,
    counters: StoreCounters,
}

impl InMemoryStore {
    /// Store whose batches are all-or-nothing
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            atomic_batches: true,
            failures: Mutex::new(FailurePlan::default()),
            set_bits_done: AtomicU64::new(0),
            counters: StoreCounters::default(),
        }
    }

    /// Store that applies batches write by write
    pub fn non_atomic() -> Self {
        Self {
            atomic_batches: false,
            ..Self::new()
        }
    }

    /// Replace the failure plan
    pub fn set_failures(&self, plan: FailurePlan) {
        *self.failures.lock() = plan;
        self.set_bits_done.store(0, Ordering::SeqCst);
    }

    /// Operation counters
    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    /// Live (non-expired) keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let data = self.data.read();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time to live of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .read()
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(now))
    }

    /// Raw bytes of a bitmap key
    pub fn bitmap_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.data.read().get(key) {
            Some(e) if !e.is_expired(now) => match &e.value {
                Value::Bitmap(bytes) => Some(bytes.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn check_set_bit_failure(&self) -> Result<(), StoreError> {
        let plan = self.failures.lock();
        if let Some(limit) = plan.set_bit_after {
            if self.set_bits_done.load(Ordering::SeqCst) >= limit as u64 {
                return Err(StoreError::Unavailable("injected set_bit failure".to_string()));
            }
        }
        Ok(())
    }

    fn write_bit(
        data: &mut HashMap<String, Entry>,
        key: &str,
        offset: UserOffset,
        value: BitValue,
    ) -> Result<BitValue, StoreError> {
        check_offset(offset)?;
        let now = Instant::now();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Bitmap(Vec::new())));
        let bytes = match &mut entry.value {
            Value::Bitmap(bytes) => bytes,
            _ => return Err(StoreError::Response(WRONGTYPE.to_string())),
        };

        let byte = (offset / 8) as usize;
        let mask = 0x80u8 >> (offset % 8);
        if bytes.len() <= byte {
            bytes.resize(byte + 1, 0);
        }
        let previous = BitValue::from(bytes[byte] & mask != 0);
        if value.is_set() {
            bytes[byte] |= mask;
        } else {
            bytes[byte] &= !mask;
        }
        Ok(previous)
    }

    /// Bitmap bytes for reading; absent or expired keys are empty
    fn read_bitmap(data: &HashMap<String, Entry>, key: &str) -> Result<Vec<u8>, StoreError> {
        let now = Instant::now();
        match data.get(key) {
            Some(e) if !e.is_expired(now) => match &e.value {
                Value::Bitmap(bytes) => Ok(bytes.clone()),
                _ => Err(StoreError::Response(WRONGTYPE.to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BitmapStore for InMemoryStore {
    fn store_id(&self) -> &str {
        "in-memory-bitmap-store-v1"
    }

    fn is_atomic_batch(&self) -> bool {
        self.atomic_batches
    }

    async fn set_bit(
        &self,
        key: &str,
        offset: UserOffset,
        value: BitValue,
    ) -> Result<BitValue, StoreError> {
        self.check_set_bit_failure()?;
        let previous = Self::write_bit(&mut self.data.write(), key, offset, value)?;
        self.set_bits_done.fetch_add(1, Ordering::SeqCst);
        self.counters.bit_writes.fetch_add(1, Ordering::Relaxed);
        Ok(previous)
    }

    async fn get_bit(&self, key: &str, offset: UserOffset) -> Result<BitValue, StoreError> {
        check_offset(offset)?;
        let bytes = Self::read_bitmap(&self.data.read(), key)?;
        let byte = (offset / 8) as usize;
        let mask = 0x80u8 >> (offset % 8);
        Ok(BitValue::from(
            bytes.get(byte).is_some_and(|b| b & mask != 0),
        ))
    }

    async fn bit_count(&self, key: &str) -> Result<u64, StoreError> {
        if let Some(e) = self.failures.lock().next_bit_count.take() {
            return Err(e);
        }
        let bytes = Self::read_bitmap(&self.data.read(), key)?;
        Ok(bytes.iter().map(|b| b.count_ones() as u64).sum())
    }

    async fn bit_op(
        &self,
        op: BitOp,
        dest: &str,
        sources: &[String],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        if let Some(e) = self.failures.lock().next_bit_op.take() {
            return Err(e);
        }
        if sources.is_empty() || (op == BitOp::Not && sources.len() != 1) {
            return Err(StoreError::Response(
                "ERR wrong number of arguments for 'bitop' command".to_string(),
            ));
        }
        self.counters.bit_ops.fetch_add(1, Ordering::Relaxed);

        let mut data = self.data.write();
        let inputs = sources
            .iter()
            .map(|k| Self::read_bitmap(&data, k))
            .collect::<Result<Vec<_>, _>>()?;
        let len = inputs.iter().map(Vec::len).max().unwrap_or(0);

        let result: Vec<u8> = match op {
            BitOp::Not => inputs[0].iter().map(|b| !b).collect(),
            BitOp::And | BitOp::Or | BitOp::Xor => (0..len)
                .map(|i| {
                    let mut acc = inputs[0].get(i).copied().unwrap_or(0);
                    for input in &inputs[1..] {
                        let b = input.get(i).copied().unwrap_or(0);
                        acc = match op {
                            BitOp::And => acc & b,
                            BitOp::Or => acc | b,
                            _ => acc ^ b,
                        };
                    }
                    acc
                })
                .collect(),
        };

        let result_len = result.len() as u64;
        if result.is_empty() {
            data.remove(dest);
        } else {
            data.insert(
                dest.to_string(),
                Entry {
                    value: Value::Bitmap(result),
                    // A TTL too large to represent never expires
                    expires_at: ttl.and_then(|d| Instant::now().checked_add(d)),
                },
            );
        }
        Ok(result_len)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.failures.lock().delete {
            return Err(e.clone());
        }
        let now = Instant::now();
        Ok(self
            .data
            .write()
            .remove(key)
            .is_some_and(|e| !e.is_expired(now)))
    }

    async fn exec_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if !self.atomic_batches {
            return exec_sequential(self, batch).await;
        }

        self.check_set_bit_failure()?;
        let mut data = self.data.write();
        // Validate every write first so an error leaves nothing applied
        let now = Instant::now();
        for write in batch.writes() {
            check_offset(write.offset)?;
            if let Some(e) = data.get(&write.key) {
                if !e.is_expired(now) && !matches!(e.value, Value::Bitmap(_)) {
                    return Err(StoreError::Response(WRONGTYPE.to_string()));
                }
            }
        }
        let total = batch.len() as u64;
        for write in batch.into_writes() {
            Self::write_bit(&mut data, &write.key, write.offset, write.value)?;
        }
        self.set_bits_done.fetch_add(total, Ordering::SeqCst);
        self.counters.bit_writes.fetch_add(total, Ordering::Relaxed);
        Ok(())
    }

    async fn assign_offset(
        &self,
        users_key: &str,
        counter_key: &str,
        user: &str,
    ) -> Result<OffsetAssignment, StoreError> {
        let mut data = self.data.write();

        if let Some(entry) = data.get(users_key) {
            match &entry.value {
                Value::Hash(users) => {
                    if let Some(&offset) = users.get(user) {
                        return Ok(OffsetAssignment {
                            offset,
                            created: false,
                        });
                    }
                },
                _ => return Err(StoreError::Response(WRONGTYPE.to_string())),
            }
        }

        let counter = data
            .entry(counter_key.to_string())
            .or_insert_with(|| Entry::new(Value::Counter(0)));
        let offset = match &mut counter.value {
            Value::Counter(n) => {
                let offset = *n;
                *n += 1;
                offset
            },
            _ => return Err(StoreError::Response(WRONGTYPE.to_string())),
        };

        let users = data
            .entry(users_key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        if let Value::Hash(users) = &mut users.value {
            users.insert(user.to_string(), offset);
        }

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(OffsetAssignment {
            offset,
            created: true,
        })
    }

    async fn lookup_offset(
        &self,
        users_key: &str,
        user: &str,
    ) -> Result<Option<UserOffset>, StoreError> {
        match self.data.read().get(users_key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Hash(users) => Ok(users.get(user).copied()),
                _ => Err(StoreError::Response(WRONGTYPE.to_string())),
            },
        }
    }

    async fn counter(&self, counter_key: &str) -> Result<u64, StoreError> {
        match self.data.read().get(counter_key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Counter(n) => Ok(*n),
                _ => Err(StoreError::Response(WRONGTYPE.to_string())),
            },
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_and_get_bit() {
        let store = InMemoryStore::new();
        assert_eq!(store.set_bit("k", 9, BitValue::Set).await.unwrap(), BitValue::Clear);
        assert_eq!(store.set_bit("k", 9, BitValue::Set).await.unwrap(), BitValue::Set);
        assert_eq!(store.get_bit("k", 9).await.unwrap(), BitValue::Set);
        assert_eq!(store.get_bit("k", 8).await.unwrap(), BitValue::Clear);
        assert_eq!(store.get_bit("missing", 0).await.unwrap(), BitValue::Clear);
        // Offset 9 lives in the second byte, second most significant bit
        assert_eq!(store.bitmap_bytes("k").unwrap(), vec![0x00, 0x40]);
    }

    #[tokio::test]
    async fn test_bit_count() {
        let store = InMemoryStore::new();
        for offset in [0, 1, 17, 100] {
            store.set_bit("k", offset, BitValue::Set).await.unwrap();
        }
        store.set_bit("k", 1, BitValue::Clear).await.unwrap();
        assert_eq!(store.bit_count("k").await.unwrap(), 3);
        assert_eq!(store.bit_count("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bit_op_zero_extends() {
        let store = InMemoryStore::new();
        store.set_bit("a", 0, BitValue::Set).await.unwrap();
        store.set_bit("b", 0, BitValue::Set).await.unwrap();
        store.set_bit("b", 20, BitValue::Set).await.unwrap();

        let len = store
            .bit_op(BitOp::Or, "dest", &keys(&["a", "b"]), None)
            .await
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(store.bit_count("dest").await.unwrap(), 2);

        store
            .bit_op(BitOp::And, "dest", &keys(&["a", "b"]), None)
            .await
            .unwrap();
        assert_eq!(store.bit_count("dest").await.unwrap(), 1);

        store
            .bit_op(BitOp::Xor, "dest", &keys(&["a", "b"]), None)
            .await
            .unwrap();
        assert_eq!(store.bit_count("dest").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bit_op_with_absent_key() {
        let store = InMemoryStore::new();
        store.set_bit("a", 3, BitValue::Set).await.unwrap();

        store
            .bit_op(BitOp::And, "dest", &keys(&["a", "nope"]), None)
            .await
            .unwrap();
        assert_eq!(store.bit_count("dest").await.unwrap(), 0);

        store
            .bit_op(BitOp::Or, "dest", &keys(&["a", "nope"]), None)
            .await
            .unwrap();
        assert_eq!(store.bit_count("dest").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bit_op_not_inverts_whole_bytes() {
        let store = InMemoryStore::new();
        store.set_bit("a", 0, BitValue::Set).await.unwrap();
        store
            .bit_op(BitOp::Not, "dest", &keys(&["a"]), None)
            .await
            .unwrap();
        assert_eq!(store.bitmap_bytes("dest").unwrap(), vec![0x7f]);

        // NOT of an absent key is empty and removes the destination
        let len = store
            .bit_op(BitOp::Not, "dest", &keys(&["nope"]), None)
            .await
            .unwrap();
        assert_eq!(len, 0);
        assert!(store.keys().iter().all(|k| k != "dest"));
    }

    #[tokio::test]
    async fn test_bit_op_ttl() {
        let store = InMemoryStore::new();
        store.set_bit("a", 0, BitValue::Set).await.unwrap();
        store
            .bit_op(BitOp::Or, "tmp", &keys(&["a"]), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let ttl = store.ttl("tmp").unwrap();
        assert!(ttl > Duration::from_secs(50));
        assert!(store.ttl("a").is_none());
    }

    #[tokio::test]
    async fn test_expired_key_is_absent() {
        let store = InMemoryStore::new();
        store.set_bit("a", 0, BitValue::Set).await.unwrap();
        store
            .bit_op(BitOp::Or, "tmp", &keys(&["a"]), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.bit_count("tmp").await.unwrap(), 0);
        assert!(!store.keys().contains(&"tmp".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = InMemoryStore::new();
        store.assign_offset("users", "next", "alice").await.unwrap();
        assert!(matches!(
            store.bit_count("users").await,
            Err(StoreError::Response(_))
        ));
        assert!(matches!(
            store.set_bit("users", 1, BitValue::Set).await,
            Err(StoreError::Response(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_offset() {
        let store = InMemoryStore::new();
        let a = store.assign_offset("users", "next", "alice").await.unwrap();
        let b = store.assign_offset("users", "next", "bob").await.unwrap();
        let a2 = store.assign_offset("users", "next", "alice").await.unwrap();

        assert_eq!(a, OffsetAssignment { offset: 0, created: true });
        assert_eq!(b, OffsetAssignment { offset: 1, created: true });
        assert_eq!(a2, OffsetAssignment { offset: 0, created: false });
        assert_eq!(store.counter("next").await.unwrap(), 2);
        assert_eq!(store.lookup_offset("users", "bob").await.unwrap(), Some(1));
        assert_eq!(store.lookup_offset("users", "carol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_atomic_batch_all_or_nothing() {
        let store = InMemoryStore::new();
        store.assign_offset("users", "next", "alice").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.set_bit("a", 1, BitValue::Set);
        batch.set_bit("users", 1, BitValue::Set);
        assert!(store.exec_batch(batch).await.is_err());
        assert_eq!(store.bit_count("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_atomic_batch_reports_partial_write() {
        let store = InMemoryStore::non_atomic();
        store.set_failures(FailurePlan {
            set_bit_after: Some(2),
            ..Default::default()
        });

        let mut batch = WriteBatch::new();
        for key in ["a", "b", "c", "d"] {
            batch.set_bit(key, 0, BitValue::Set);
        }
        let err = store.exec_batch(batch).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::PartialWrite {
                applied: 2,
                total: 4,
                ..
            }
        ));
        assert_eq!(store.bit_count("b").await.unwrap(), 1);
        assert_eq!(store.bit_count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offset_past_limit_rejected() {
        let store = InMemoryStore::new();

        for offset in [BIT_OFFSET_LIMIT, 1 << 40, u64::MAX] {
            assert!(matches!(
                store.set_bit("k", offset, BitValue::Set).await,
                Err(StoreError::Response(msg)) if msg == OFFSET_OUT_OF_RANGE
            ));
            assert!(matches!(
                store.get_bit("k", offset).await,
                Err(StoreError::Response(_))
            ));
        }
        assert!(store.keys().is_empty());
        assert_eq!(store.counters().bit_writes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_atomic_batch_rejects_bad_offset_before_writing() {
        let store = InMemoryStore::new();

        let mut batch = WriteBatch::new();
        batch.set_bit("a", 3, BitValue::Set);
        batch.set_bit("b", 1 << 40, BitValue::Set);
        assert!(matches!(
            store.exec_batch(batch).await,
            Err(StoreError::Response(_))
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_expire() {
        let store = InMemoryStore::new();
        store.set_bit("a", 0, BitValue::Set).await.unwrap();

        store
            .bit_op(BitOp::Or, "tmp", &keys(&["a"]), Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(store.bit_count("tmp").await.unwrap(), 1);
        assert!(store.ttl("tmp").is_none());
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = InMemoryStore::new();
        store.set_bit("x:1", 0, BitValue::Set).await.unwrap();
        store.set_bit("x:2", 0, BitValue::Set).await.unwrap();
        store.set_bit("y:1", 0, BitValue::Set).await.unwrap();
        assert_eq!(
            store.keys_with_prefix("x:").await.unwrap(),
            vec!["x:1".to_string(), "x:2".to_string()]
        );
    }
}
