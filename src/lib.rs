//! Bitesized - bitmap analytics for per-user events
//!
//! This library tracks which users triggered which events over time, one
//! bit per user per time bucket, and answers set-algebra questions such as
//! "how many users logged in this week but did not purchase":
//! - Interval catalog mapping timestamps to hour, day, week, month, ... buckets
//! - Stable user id → bit offset registry with atomic allocation
//! - Multi-interval event recording in one batch
//! - AND / OR / XOR / NOT evaluation returning cardinalities
//! - Redis and in-memory stores behind one trait
//!
//! # Example
//!
//! ```rust
//! use bitesized::{Bitesized, BitOp, Granularity, InMemoryStore};
//! use chrono::Utc;
//!
//! # async fn example() -> bitesized::Result<()> {
//! let engine = Bitesized::builder().with_store(InMemoryStore::new()).build()?;
//! let now = Utc::now();
//!
//! engine.track("login", "alice", now).await?;
//! engine.track("login", "bob", now).await?;
//! engine.track("purchase", "bob", now).await?;
//!
//! let logins = engine.event_key("login", now, Granularity::Week)?;
//! let purchases = engine.event_key("purchase", now, Granularity::Week)?;
//! assert_eq!(engine.evaluate(BitOp::And, &[logins, purchases]).await?, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod interval;
pub mod keys;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber setup
pub mod logging;

/// Redis backend for the bitmap store
pub mod redis;

pub use config::Config;
pub use engine::memory::InMemoryStore;
pub use engine::{Bitesized, BitesizedBuilder, BitmapStore, RetentionTable};
pub use error::{Error, Result, StoreError};
pub use interval::{Granularity, IntervalCatalog};
pub use keys::KeyEncoder;
pub use redis::RedisBitmapStore;
pub use types::{BitOp, BitValue, UserOffset};
