use super::{KeyValueStore, KvOp, WriteBatch};
use crate::{PersistenceError, Result};
use parking_lot::Mutex;
use redis::{Client, Connection, Pipeline};
use std::collections::HashMap;
use tracing::info;

/// `KeyValueStore` over one synchronous connection to a Redis server
pub struct RedisConnection {
    conn: Mutex<Connection>,
}

impl RedisConnection {
    /// Connect and verify the server answers PING
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_connection()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;

        info!("Connected to Redis at {}", url);

        Ok(RedisConnection {
            conn: Mutex::new(conn),
        })
    }
}

fn push_op(pipe: &mut Pipeline, op: &KvOp) {
    match op {
        KvOp::HashSet { key, fields } => {
            pipe.cmd("HSET").arg(key).arg(fields).ignore();
        }
        KvOp::SortedSetAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        KvOp::SortedSetRemove { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
        KvOp::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        KvOp::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
    }
}

/// Scores come back as strings and may be written in float notation
fn parse_score(raw: &str) -> Option<i64> {
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|score| score as i64))
}

impl KeyValueStore for RedisConnection {
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.lock();
        Ok(redis::cmd("HGETALL").arg(key).query(&mut *conn)?)
    }

    fn sorted_set_pop_min(&self, key: &str) -> Result<Option<(String, i64)>> {
        let mut conn = self.conn.lock();
        // Reply is [member, score] or empty
        let reply: Vec<String> = redis::cmd("ZPOPMIN").arg(key).query(&mut *conn)?;
        let mut reply = reply.into_iter();
        let (Some(member), Some(score)) = (reply.next(), reply.next()) else {
            return Ok(None);
        };
        let score = parse_score(&score)
            .ok_or_else(|| PersistenceError::corrupted(key, format!("invalid score '{}'", score)))?;
        Ok(Some((member, score)))
    }

    fn sorted_set_range_below(&self, key: &str, max_exclusive: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", max_exclusive))
            .query(&mut *conn)?)
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        Ok(redis::cmd("SMEMBERS").arg(key).query(&mut *conn)?)
    }

    fn commit(&self, batch: WriteBatch) -> Result<bool> {
        let mut conn = self.conn.lock();

        if batch.guards.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &batch.ops {
                push_op(&mut pipe, op);
            }
            pipe.query::<()>(&mut *conn)?;
            return Ok(true);
        }

        // WATCH the guarded keys, check the guards, then MULTI/EXEC. An
        // aborted EXEC re-runs the closure, which re-reads the guards.
        let keys = batch.guarded_keys();
        let committed = redis::transaction(&mut *conn, &keys, |con, pipe| {
            for guard in &batch.guards {
                let current: Option<String> = redis::cmd("HGET")
                    .arg(&guard.key)
                    .arg(&guard.field)
                    .query(con)?;
                if current.as_deref() != Some(guard.expected.as_str()) {
                    return Ok(Some(false));
                }
            }

            for op in &batch.ops {
                push_op(pipe, op);
            }
            pipe.query::<Option<()>>(con).map(|reply| reply.map(|_| true))
        })?;

        Ok(committed)
    }
}
