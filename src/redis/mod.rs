//! Redis backend for the bitmap store
//!
//! # Architecture
//!
//! ```text
//! Redis Schema:
//! {prefix}:event:{event}:{label}   → STRING used as a bitmap
//! {prefix}:users                   → HASH user id → offset
//! {prefix}:users:next              → STRING counter of allocated offsets
//! {prefix}:scratch:{id}            → STRING, BITOP destination with a TTL
//! ```
//!
//! # Features
//!
//! - Bounded concurrency over a multiplexed connection
//! - Per-command deadlines, reconnect after connection loss
//! - Atomic offset allocation and batch writes via Lua scripts
//! - BITOP and its expiry in one MULTI/EXEC transaction
//! - Optional TLS (`redis-tls` feature)
//!
//! # Example
//!
//! ```rust,no_run
//! use bitesized::redis::{RedisBitmapStore, RedisConfig};
//! use bitesized::engine::traits::BitmapStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisBitmapStore::new(RedisConfig::default()).await?;
//! assert_eq!(store.store_id(), "redis-bitmap-store-v1");
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod scripts;
pub mod store;
pub mod util;

pub use connection::{ConnectBackoff, PoolStats, PoolStatsSnapshot, RedisConfig, RedisPool};
pub use scripts::LuaScripts;
pub use store::RedisBitmapStore;
