//! Redis connection handling
//!
//! [`RedisPool`] shares one multiplexed connection between callers. A
//! semaphore bounds the commands in flight and every command runs under a
//! deadline. When a command fails at the connection level the cached
//! connection is dropped, and the next command reconnects with
//! [`ConnectBackoff`].
//!
//! Commands are never re-issued. A failed command surfaces as a
//! [`StoreError`] and the caller decides whether repeating it is safe.
//!
//! # Example
//!
//! ```rust,no_run
//! use bitesized::redis::{RedisConfig, RedisPool};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::with_url("redis://localhost:6379")
//!     .pool_size(32)
//!     .command_timeout(Duration::from_millis(500));
//!
//! let pool = RedisPool::new(config).await?;
//! let pong: String = pool
//!     .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::StoreError;
use crate::metrics;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::util::{classify_redis_error, connection_error_message, safe_redis_error};

/// Upper bound on concurrent commands
const MAX_POOL_SIZE: u32 = 1000;

/// Settings for [`RedisPool`]
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Server URL, `redis://` or `rediss://`
    pub url: String,

    /// Commands allowed in flight at once
    /// Default: 16
    pub pool_size: u32,

    /// Deadline for establishing a connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Deadline for each command
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Backoff between connect attempts
    pub backoff: ConnectBackoff,

    /// Use TLS (needs the `redis-tls` feature)
    pub tls_enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            backoff: ConnectBackoff::default(),
            tls_enabled: false,
        }
    }
}

impl RedisConfig {
    /// Defaults pointed at `url`
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the in-flight command limit
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connect deadline
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the per-command deadline
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the connect backoff
    pub fn connect_backoff(mut self, backoff: ConnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable TLS
    ///
    /// Requires the `redis-tls` feature and a `rediss://` URL.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Check the settings before connecting
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(format!(
                "Pool size must be between 1 and {}, got {}",
                MAX_POOL_SIZE, self.pool_size
            ));
        }
        if self.command_timeout.is_zero() {
            return Err("Command timeout must be greater than 0".to_string());
        }

        #[cfg(not(feature = "redis-tls"))]
        if self.tls_enabled {
            return Err("TLS requested but the 'redis-tls' feature is not compiled in".to_string());
        }

        let secure_scheme = self.url.starts_with("rediss://");
        match (self.tls_enabled, secure_scheme) {
            (true, false) => Err("TLS is enabled but the URL does not use 'rediss://'".to_string()),
            (false, true) => Err("URL uses 'rediss://' but TLS is not enabled".to_string()),
            _ => Ok(()),
        }
    }
}

/// Exponential backoff between connect attempts
///
/// Only connecting backs off; commands fail on the first error.
#[derive(Clone, Debug)]
pub struct ConnectBackoff {
    /// Attempts after the first
    /// Default: 3
    pub max_retries: u32,

    /// Delay before the first retry
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Ceiling on any delay
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Growth factor per attempt
    /// Default: 2.0
    pub multiplier: f64,

    /// Stretch each delay by up to 25% at random
    /// Default: true
    pub jitter: bool,
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ConnectBackoff {
    /// Give up after the first failed attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let mut millis = grown.min(self.max_delay.as_millis() as f64);
        if self.jitter {
            millis *= 1.0 + rand::random::<f64>() * 0.25;
        }
        // Float to int casts saturate, NaN becomes 0
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Counters kept by a [`RedisPool`]
#[derive(Debug, Default)]
pub struct PoolStats {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    commands: AtomicU64,
    command_failures: AtomicU64,
    timeouts: AtomicU64,
    latency_us: AtomicU64,
}

impl PoolStats {
    fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn command_done(&self, latency: Duration) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn command_failed(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn command_timed_out(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let commands = self.commands.load(Ordering::Relaxed);
        let latency_us = self.latency_us.load(Ordering::Relaxed);
        PoolStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            commands,
            command_failures: self.command_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_latency_us: if commands == 0 {
                0.0
            } else {
                latency_us as f64 / commands as f64
            },
        }
    }
}

/// Copy of [`PoolStats`]
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatsSnapshot {
    /// Connections established
    pub connects: u64,
    /// Failed connect attempts
    pub connect_failures: u64,
    /// Commands that succeeded
    pub commands: u64,
    /// Commands that failed, timeouts included
    pub command_failures: u64,
    /// Commands that hit their deadline
    pub timeouts: u64,
    /// Mean latency of successful commands
    pub average_latency_us: f64,
}

/// Shared Redis connection with bounded concurrency
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    stats: PoolStats,
    permits: Semaphore,
}

impl RedisPool {
    /// Connect eagerly, backing off per the configured [`ConnectBackoff`]
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::Unavailable)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            permits: Semaphore::new(config.pool_size as usize),
            config,
            stats: PoolStats::default(),
        };
        pool.reconnect().await?;

        debug!(pool_size = pool.config.pool_size, "Redis pool ready");
        Ok(pool)
    }

    /// Run `f` on the shared connection under the command deadline
    ///
    /// Connection-level failures drop the cached connection so the next
    /// call reconnects. `f` itself runs at most once.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("connection pool closed".to_string()))?;
        let conn = self.connection().await?;

        let start = Instant::now();
        match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
            Ok(Ok(value)) => {
                self.stats.command_done(start.elapsed());
                Ok(value)
            },
            Ok(Err(e)) => {
                self.stats.command_failed();
                if e.is_connection_dropped() || e.is_io_error() {
                    warn!("Redis connection lost, reconnecting on next command");
                    *self.connection.write().await = None;
                    metrics::record_store_connection(false);
                }
                Err(classify_redis_error(&self.config.url, &e))
            },
            Err(_) => {
                self.stats.command_timed_out();
                warn!(deadline = ?self.config.command_timeout, "Redis command timed out");
                Err(StoreError::Timeout(format!(
                    "command exceeded deadline of {:?}",
                    self.config.command_timeout
                )))
            },
        }
    }

    /// Whether a connection is currently cached
    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Pool counters
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Pool settings
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.connection.read().await.clone();
        match cached {
            Some(conn) => Ok(conn),
            None => self.reconnect().await,
        }
    }

    async fn reconnect(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut attempt = 0;
        loop {
            match self.connect_once().await {
                Ok(conn) => {
                    *self.connection.write().await = Some(conn.clone());
                    metrics::record_store_connection(true);
                    return Ok(conn);
                },
                Err(e) if self.config.backoff.allows_retry(attempt) => {
                    let delay = self.config.backoff.delay(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %e, "Redis connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    metrics::record_store_connection(false);
                    return Err(e);
                },
            }
        }
    }

    async fn connect_once(&self) -> Result<MultiplexedConnection, StoreError> {
        let start = Instant::now();
        let connecting = self.client.get_multiplexed_async_connection();

        let result = match tokio::time::timeout(self.config.connection_timeout, connecting).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Unavailable(safe_redis_error(&self.config.url, &e))),
            Err(_) => Err(StoreError::Unavailable(connection_error_message(
                &self.config.url,
                "connection timeout",
            ))),
        };

        match &result {
            Ok(_) => {
                self.stats.connected();
                debug!(elapsed = ?start.elapsed(), "Redis connection established");
            },
            Err(_) => self.stats.connect_failed(),
        }
        result
    }
}
