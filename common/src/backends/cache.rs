use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend request failed: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Key-scoped operations the gateway needs from its fast cache.
///
/// Nothing stored behind this trait is authoritative; every key can be
/// reconstructed from the configuration store. The window operations exist
/// for the sliding-window rate limiter and are each a single atomic step on
/// backends that support pipelining.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    /// Delete every key starting with `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, CacheError>;
    async fn set_add(&self, key: &str, members: &[String], ttl: Duration)
        -> Result<(), CacheError>;

    /// Drop window members scored at or below `cutoff_ms` and return the
    /// number of members left.
    async fn window_slide(&self, key: &str, cutoff_ms: i64) -> Result<u64, CacheError>;
    /// Score of the earliest member still in the window.
    async fn window_earliest(&self, key: &str) -> Result<Option<i64>, CacheError>;
    /// Add a member at `score_ms` and refresh the key's expiry.
    async fn window_add(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> Result<(), CacheError>;
}

enum Slot {
    Text(String),
    Set(HashSet<String>),
    Window(BTreeSet<(i64, String)>),
}

struct Entry {
    slot: Slot,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local cache used by tests and single-node deployments.
///
/// Expiry is enforced lazily on access; there is no reaper task.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.live(now) => match &entry.slot {
                Slot::Text(value) => Ok(Some(value.clone())),
                _ => Ok(None),
            },
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        Ok(entries
            .remove(key)
            .map(|entry| entry.live(now))
            .unwrap_or(false))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));

        Ok((before - entries.len()) as u64)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.live(now) => match &entry.slot {
                Slot::Set(members) => Ok(members.clone()),
                _ => Ok(HashSet::new()),
            },
            Some(_) => {
                entries.remove(key);
                Ok(HashSet::new())
            }
            None => Ok(HashSet::new()),
        }
    }

    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        let stale = match entries.get(key) {
            Some(entry) if entry.live(now) => !matches!(entry.slot, Slot::Set(_)),
            _ => true,
        };
        if stale {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Set(HashSet::new()),
                    expires_at: now + ttl,
                },
            );
        }

        let entry = entries.get_mut(key).expect("the entry was just ensured");
        entry.expires_at = now + ttl;
        if let Slot::Set(set) = &mut entry.slot {
            set.extend(members.iter().cloned());
        }

        Ok(())
    }

    async fn window_slide(&self, key: &str, cutoff_ms: i64) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                if let Slot::Window(window) = &mut entry.slot {
                    *window = window.split_off(&(cutoff_ms + 1, String::new()));
                    Ok(window.len() as u64)
                } else {
                    Ok(0)
                }
            }
            Some(_) => {
                entries.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn window_earliest(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.live(now) => match &entry.slot {
                Slot::Window(window) => Ok(window.iter().next().map(|(score, _)| *score)),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    async fn window_add(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("cache lock should not be poisoned");
        let now = Instant::now();

        let stale = match entries.get(key) {
            Some(entry) if entry.live(now) => !matches!(entry.slot, Slot::Window(_)),
            _ => true,
        };
        if stale {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Window(BTreeSet::new()),
                    expires_at: now + ttl,
                },
            );
        }

        let entry = entries.get_mut(key).expect("the entry was just ensured");
        entry.expires_at = now + ttl;
        if let Slot::Window(window) = &mut entry.slot {
            window.insert((score_ms, member.to_string()));
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Shared cache backed by a redis server.
///
/// The two-phase window operations run as `MULTI`/`EXEC` pipelines so that
/// concurrent admissions only ever race between the prune-count and the
/// insert, never within either.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();

        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;

        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(format!("{prefix}*")).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;

        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, CacheError> {
        let mut conn = self.conn.clone();

        Ok(conn.smembers(key).await?)
    }

    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .sadd(key, members)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn window_slide(&self, key: &str, cutoff_ms: i64) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let (_removed, count): (u64, u64) = redis::pipe()
            .atomic()
            .zrembyscore(key, "-inf", cutoff_ms)
            .zcard(key)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn window_earliest(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let earliest: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;

        Ok(earliest.first().map(|(_, score)| *score as i64))
    }

    async fn window_add(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zadd(key, member, score_ms)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        Ok(())
    }
}
