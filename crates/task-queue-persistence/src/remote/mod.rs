//! Key-value backed task store.
//!
//! `RedisTaskStore` only talks to a `KeyValueStore`, a narrow slice of the
//! Redis data model (hashes, sorted sets, sets, guarded atomic batches). A
//! live Redis server and the in-process `MemoryKeyValueStore` both implement
//! it, so the same store logic runs against either.

mod connection;
mod memory;
mod store;

pub use connection::RedisConnection;
pub use memory::MemoryKeyValueStore;
pub use store::RedisTaskStore;

use crate::Result;
use std::collections::HashMap;

/// One write inside a `WriteBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// HSET key field value [field value ...]
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// ZADD key score member
    SortedSetAdd {
        key: String,
        member: String,
        score: i64,
    },
    /// ZREM key member
    SortedSetRemove { key: String, member: String },
    /// SADD key member
    SetAdd { key: String, member: String },
    /// SREM key member
    SetRemove { key: String, member: String },
}

/// Precondition on a hash field; the batch is dropped if it does not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGuard {
    pub key: String,
    pub field: String,
    pub expected: String,
}

/// Writes applied all-or-nothing, after every guard has been checked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub guards: Vec<FieldGuard>,
    pub ops: Vec<KvOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, key: &str, field: &str, expected: &str) -> Self {
        self.guards.push(FieldGuard {
            key: key.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
        });
        self
    }

    pub fn hash_set(mut self, key: &str, fields: Vec<(String, String)>) -> Self {
        self.ops.push(KvOp::HashSet {
            key: key.to_string(),
            fields,
        });
        self
    }

    pub fn sorted_set_add(mut self, key: &str, member: &str, score: i64) -> Self {
        self.ops.push(KvOp::SortedSetAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        self
    }

    pub fn sorted_set_remove(mut self, key: &str, member: &str) -> Self {
        self.ops.push(KvOp::SortedSetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn set_add(mut self, key: &str, member: &str) -> Self {
        self.ops.push(KvOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn set_remove(mut self, key: &str, member: &str) -> Self {
        self.ops.push(KvOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    /// Keys named by the guards, deduplicated in first-seen order
    pub fn guarded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for guard in &self.guards {
            if !keys.contains(&guard.key) {
                keys.push(guard.key.clone());
            }
        }
        keys
    }
}

/// The Redis operations the task store relies on.
///
/// Sorted-set scores are integers here; ties order by member, as in Redis.
pub trait KeyValueStore: Send + Sync {
    /// HGETALL; an empty map means the key does not exist
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// ZPOPMIN: atomically remove and return the lowest-scored member with its score
    fn sorted_set_pop_min(&self, key: &str) -> Result<Option<(String, i64)>>;

    /// Members with a score strictly below `max_exclusive`, lowest first
    fn sorted_set_range_below(&self, key: &str, max_exclusive: i64) -> Result<Vec<String>>;

    /// SMEMBERS
    fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Apply the batch atomically. Returns `false` without writing anything
    /// when a guard does not match.
    fn commit(&self, batch: WriteBatch) -> Result<bool>;
}
