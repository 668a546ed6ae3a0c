//! Redis-backed bitmap store
//!
//! Event bitmaps are plain Redis strings addressed with SETBIT/GETBIT,
//! combined with BITOP and counted with BITCOUNT. User offsets live in a
//! hash next to an INCR counter; allocation runs as one Lua script.
//!
//! BITOP runs outside Lua: a script would have to `unpack` the operand list,
//! which Lua caps at a few thousand values, while BITOP itself takes any
//! number of keys.

use super::connection::{RedisConfig, RedisPool};
use super::scripts::LuaScripts;
use super::util::escape_glob;
use crate::engine::traits::{BitmapStore, OffsetAssignment, WriteBatch};
use crate::error::StoreError;
use crate::types::{BitOp, BitValue, UserOffset};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Keys requested per SCAN round-trip
const SCAN_BATCH: usize = 500;

/// [`BitmapStore`] on top of a Redis server
pub struct RedisBitmapStore {
    pool: Arc<RedisPool>,
    scripts: LuaScripts,
}

impl RedisBitmapStore {
    /// Connect to Redis with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let pool = RedisPool::new(config).await?;
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Build a store over an existing pool
    pub fn from_pool(pool: Arc<RedisPool>) -> Self {
        Self {
            pool,
            scripts: LuaScripts::new(),
        }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }
}

/// BITOP into `dest`, followed by PEXPIRE when a TTL is given
///
/// Both run in one MULTI/EXEC transaction, so no other client sees the
/// destination without its expiry. PEXPIRE on an empty result finds no key
/// and does nothing.
fn bitop_pipeline(op: BitOp, dest: &str, sources: &[String], ttl: Option<Duration>) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic().cmd("BITOP").arg(op.as_str()).arg(dest);
    for source in sources {
        pipe.arg(source.as_str());
    }
    if let Some(ttl) = ttl {
        let ttl_ms = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        pipe.cmd("PEXPIRE").arg(dest).arg(ttl_ms).ignore();
    }
    pipe
}

#[async_trait]
impl BitmapStore for RedisBitmapStore {
    fn store_id(&self) -> &str {
        "redis-bitmap-store-v1"
    }

    fn is_atomic_batch(&self) -> bool {
        true
    }

    async fn set_bit(
        &self,
        key: &str,
        offset: UserOffset,
        value: BitValue,
    ) -> Result<BitValue, StoreError> {
        let previous: u8 = self
            .pool
            .execute(move |mut conn| async move {
                redis::cmd("SETBIT")
                    .arg(key)
                    .arg(offset)
                    .arg(value.as_u8())
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(BitValue::from(previous != 0))
    }

    async fn get_bit(&self, key: &str, offset: UserOffset) -> Result<BitValue, StoreError> {
        let bit: u8 = self
            .pool
            .execute(move |mut conn| async move {
                redis::cmd("GETBIT")
                    .arg(key)
                    .arg(offset)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(BitValue::from(bit != 0))
    }

    async fn bit_count(&self, key: &str) -> Result<u64, StoreError> {
        self.pool
            .execute(move |mut conn| async move {
                redis::cmd("BITCOUNT").arg(key).query_async(&mut conn).await
            })
            .await
    }

    async fn bit_op(
        &self,
        op: BitOp,
        dest: &str,
        sources: &[String],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        if sources.is_empty() {
            return Err(StoreError::Response(
                "ERR wrong number of arguments for 'bitop' command".to_string(),
            ));
        }

        let pipe = bitop_pipeline(op, dest, sources, ttl);
        self.pool
            .execute(move |mut conn| async move {
                let (len,): (u64,) = pipe.query_async(&mut conn).await?;
                Ok(len)
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u64 = self
            .pool
            .execute(move |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exec_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let total = batch.len();
        let script = self.scripts.set_bits();

        let applied: usize = self
            .pool
            .execute(move |mut conn| async move {
                let mut invocation = script.prepare_invoke();
                for write in batch.writes() {
                    invocation
                        .key(write.key.as_str())
                        .arg(write.offset)
                        .arg(write.value.as_u8());
                }
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        debug!("Applied {} of {} bit writes atomically", applied, total);
        Ok(())
    }

    async fn assign_offset(
        &self,
        users_key: &str,
        counter_key: &str,
        user: &str,
    ) -> Result<OffsetAssignment, StoreError> {
        let script = self.scripts.assign_offset();

        let (offset, created): (u64, u8) = self
            .pool
            .execute(move |mut conn| async move {
                script
                    .key(users_key)
                    .key(counter_key)
                    .arg(user)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(OffsetAssignment {
            offset,
            created: created == 1,
        })
    }

    async fn lookup_offset(
        &self,
        users_key: &str,
        user: &str,
    ) -> Result<Option<UserOffset>, StoreError> {
        self.pool
            .execute(move |mut conn| async move {
                redis::cmd("HGET")
                    .arg(users_key)
                    .arg(user)
                    .query_async(&mut conn)
                    .await
            })
            .await
    }

    async fn counter(&self, counter_key: &str) -> Result<u64, StoreError> {
        let value: Option<u64> = self
            .pool
            .execute(move |mut conn| async move {
                redis::cmd("GET").arg(counter_key).query_async(&mut conn).await
            })
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .pool
                .execute(move |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
