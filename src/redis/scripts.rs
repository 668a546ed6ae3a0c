//! Lua scripts for atomic Redis operations
//!
//! Each script runs server-side as a single step, so concurrent clients
//! never observe the intermediate states.
//!
//! # Scripts Provided
//!
//! - `assign_offset`: Get or allocate the bit offset of a user
//! - `set_bits`: Apply a batch of bit writes all-or-nothing
//!
//! # Example
//!
//! ```rust,no_run
//! use bitesized::redis::LuaScripts;
//!
//! let scripts = LuaScripts::new();
//! let assign = scripts.assign_offset();
//! ```

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Collection of Lua scripts for atomic Redis operations
///
/// Scripts are cached after first use to avoid repeated parsing.
pub struct LuaScripts {
    /// Cache of compiled scripts by name
    cache: RwLock<HashMap<String, Arc<Script>>>,
}

impl LuaScripts {
    /// Create a new LuaScripts instance
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a cached script
    fn get_or_create(&self, name: &str, lua: &str) -> Arc<Script> {
        {
            let cache = self.cache.read();
            if let Some(script) = cache.get(name) {
                return Arc::clone(script);
            }
        }

        let script = Arc::new(Script::new(lua));
        {
            let mut cache = self.cache.write();
            cache.insert(name.to_string(), Arc::clone(&script));
        }
        script
    }

    /// Get or allocate the offset of a user
    ///
    /// The counter holds the number of offsets handed out, so the new offset
    /// is the counter value before the increment. Offsets are dense and start
    /// at 0.
    ///
    /// # Keys
    /// - KEYS[1]: User hash ({prefix}:users)
    /// - KEYS[2]: Allocation counter ({prefix}:users:next)
    ///
    /// # Arguments
    /// - ARGV[1]: User identifier
    ///
    /// # Returns
    /// - `{offset, created}` where `created` is 1 when this call allocated
    pub fn assign_offset(&self) -> Arc<Script> {
        self.get_or_create(
            "assign_offset",
            r#"
            local users_key = KEYS[1]
            local counter_key = KEYS[2]
            local user = ARGV[1]

            local existing = redis.call('HGET', users_key, user)
            if existing then
                return {tonumber(existing), 0}
            end

            local offset = redis.call('INCR', counter_key) - 1
            redis.call('HSET', users_key, user, offset)

            return {offset, 1}
            "#,
        )
    }

    /// Apply a batch of bit writes all-or-nothing
    ///
    /// Every key type and offset is checked before the first write, so a
    /// rejected batch leaves the keyspace untouched.
    ///
    /// # Keys
    /// - KEYS[i]: Bitmap key of write i
    ///
    /// # Arguments
    /// - ARGV[2i-1]: Bit offset of write i
    /// - ARGV[2i]: Bit value of write i (0 or 1)
    ///
    /// # Returns
    /// - Number of writes applied
    pub fn set_bits(&self) -> Arc<Script> {
        self.get_or_create(
            "set_bits",
            r#"
            for i, key in ipairs(KEYS) do
                local kind = redis.call('TYPE', key)['ok']
                if kind ~= 'none' and kind ~= 'string' then
                    return redis.error_reply('WRONGTYPE Operation against a key holding the wrong kind of value')
                end
                local offset = tonumber(ARGV[2 * i - 1])
                if offset == nil or offset < 0 or offset >= 4294967296 then
                    return redis.error_reply('ERR bit offset is not an integer or out of range')
                end
            end

            for i, key in ipairs(KEYS) do
                redis.call('SETBIT', key, ARGV[2 * i - 1], ARGV[2 * i])
            end

            return #KEYS
            "#,
        )
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
