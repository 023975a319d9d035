use super::{KeyValueStore, KvOp, WriteBatch};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.ordered.remove(&(old, member.to_string()));
        }
    }

    fn pop_min(&mut self) -> Option<(String, i64)> {
        let (score, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some((member, score))
    }
}

#[derive(Default)]
struct Keyspace {
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, SortedSet>,
    sets: HashMap<String, HashSet<String>>,
}

impl Keyspace {
    fn apply(&mut self, op: KvOp) {
        match op {
            KvOp::HashSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            KvOp::SortedSetAdd { key, member, score } => {
                self.sorted_sets.entry(key).or_default().add(&member, score);
            }
            KvOp::SortedSetRemove { key, member } => {
                if let Some(set) = self.sorted_sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            KvOp::SetAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            KvOp::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
        }
    }
}

/// In-process stand-in for a Redis server.
///
/// Every call runs under one lock, which gives the same single-command
/// atomicity Redis offers. An optional artificial latency is slept before
/// each call to widen race windows in concurrency tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    keyspace: Mutex<Keyspace>,
    latency: Option<Duration>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        MemoryKeyValueStore {
            keyspace: Mutex::new(Keyspace::default()),
            latency: Some(latency),
        }
    }

    fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.pause();
        Ok(self.keyspace.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    fn sorted_set_pop_min(&self, key: &str) -> Result<Option<(String, i64)>> {
        self.pause();
        Ok(self
            .keyspace
            .lock()
            .sorted_sets
            .get_mut(key)
            .and_then(SortedSet::pop_min))
    }

    fn sorted_set_range_below(&self, key: &str, max_exclusive: i64) -> Result<Vec<String>> {
        self.pause();
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .sorted_sets
            .get(key)
            .map(|set| {
                set.ordered
                    .iter()
                    .take_while(|(score, _)| *score < max_exclusive)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.pause();
        Ok(self
            .keyspace
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> Result<bool> {
        self.pause();
        let mut keyspace = self.keyspace.lock();

        let guards_hold = batch.guards.iter().all(|guard| {
            keyspace
                .hashes
                .get(&guard.key)
                .and_then(|hash| hash.get(&guard.field))
                .map(|value| value == &guard.expected)
                .unwrap_or(false)
        });
        if !guards_hold {
            return Ok(false);
        }

        for op in batch.ops {
            keyspace.apply(op);
        }
        Ok(true)
    }
}
