//! Store key layout
//!
//! ```text
//! {prefix}:event:{event}:{bucket label}   → bitmap, bit N = user with offset N
//! {prefix}:users                          → HASH user id → offset
//! {prefix}:users:next                     → counter, next offset to allocate
//! {prefix}:scratch:{128-bit hex}          → temporary BITOP destination
//! ```
//!
//! Event names are escaped (`%` → `%25`, `:` → `%3A`) so the event segment
//! never contains a separator. Together with the fixed prefix this makes
//! [`KeyEncoder::encode`] injective over (event, label).
//!
//! Prefixes cannot contain `:` either. Otherwise prefix `app` would own
//! `app:scratch:*`, which is every key of an engine with prefix
//! `app:scratch`, and scavenging one engine would wipe the other.

use crate::error::{Error, Result};
use crate::interval::Granularity;
use chrono::{DateTime, Utc};

/// Default namespace prefix
pub const DEFAULT_KEY_PREFIX: &str = "bitesized";

const EVENT_SEGMENT: &str = "event";
const SCRATCH_SEGMENT: &str = "scratch";
const USERS_SEGMENT: &str = "users";
const USERS_COUNTER_SUFFIX: &str = "next";

/// Builds every key the engine reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEncoder {
    prefix: String,
}

impl KeyEncoder {
    /// Create an encoder for the given namespace prefix
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    /// Namespace prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the bitmap for `event` in the bucket named `label`
    pub fn encode(&self, event: &str, label: &str) -> Result<String> {
        if event.is_empty() {
            return Err(Error::InvalidArgument("event name cannot be empty".to_string()));
        }
        if label.is_empty() {
            return Err(Error::InvalidArgument("interval label cannot be empty".to_string()));
        }
        Ok(format!(
            "{}:{}:{}:{}",
            self.prefix,
            EVENT_SEGMENT,
            escape_event(event),
            label
        ))
    }

    /// Key of the bitmap for `event` in the `granularity` bucket containing `at`
    pub fn event_key(
        &self,
        event: &str,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<String> {
        self.encode(event, &granularity.label(at))
    }

    /// Prefix shared by every scratch key
    pub fn scratch_namespace(&self) -> String {
        format!("{}:{}:", self.prefix, SCRATCH_SEGMENT)
    }

    /// Fresh scratch key carrying 128 random bits
    ///
    /// At 128 bits, a billion queries give a collision probability below 1e-20.
    pub fn scratch_key(&self) -> String {
        let id: u128 = rand::random();
        format!("{}{:032x}", self.scratch_namespace(), id)
    }

    /// Whether `key` lives in the scratch namespace
    pub fn is_scratch_key(&self, key: &str) -> bool {
        key.starts_with(&self.scratch_namespace())
    }

    /// Whether `key` holds engine-owned data: an event bitmap or the user registry
    pub fn is_engine_key(&self, key: &str) -> bool {
        let event_namespace = format!("{}:{}:", self.prefix, EVENT_SEGMENT);
        key.starts_with(&event_namespace)
            || key == self.users_key()
            || key == self.users_counter_key()
    }

    /// HASH holding user id → offset
    pub fn users_key(&self) -> String {
        format!("{}:{}", self.prefix, USERS_SEGMENT)
    }

    /// Counter holding the next offset to allocate
    pub fn users_counter_key(&self) -> String {
        format!("{}:{}:{}", self.prefix, USERS_SEGMENT, USERS_COUNTER_SUFFIX)
    }
}

impl Default for KeyEncoder {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Validate a namespace prefix
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::Configuration("key prefix cannot be empty".to_string()));
    }
    if prefix.chars().any(char::is_whitespace) {
        return Err(Error::Configuration(format!(
            "key prefix '{}' cannot contain whitespace",
            prefix
        )));
    }
    if prefix.contains(':') {
        return Err(Error::Configuration(format!(
            "key prefix '{}' cannot contain ':'",
            prefix
        )));
    }
    Ok(())
}

fn escape_event(event: &str) -> String {
    let mut out = String::with_capacity(event.len());
    for c in event.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}
