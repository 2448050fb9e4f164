//! Redis-backed counter store for sharing slow-down counts across processes.
//!
//! Tag membership lives in sorted sets scored by each member's expiry, so
//! members of expired entries are pruned on the next write to the tag and
//! the set itself expires with its longest-lived member.

use crate::error::{SlowDownError, SlowDownResult};
use crate::store::CounterStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;

/// Prefix for every key this store writes.
const KEY_PREFIX: &str = "slowdown:";

/// Registers KEYS[1] in every tag set KEYS[2..] until KEYS[1] expires.
const TAG_ENTRY: &str = r"
local function tag_entry()
  local ttl = redis.call('PTTL', KEYS[1])
  local time = redis.call('TIME')
  local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
  for i = 2, #KEYS do
    if ttl > 0 then
      redis.call('ZADD', KEYS[i], now + ttl, KEYS[1])
    end
    redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', now)
    local last = redis.call('ZRANGE', KEYS[i], -1, -1, 'WITHSCORES')
    if last[2] then
      redis.call('PEXPIREAT', KEYS[i], last[2])
    end
  end
end
";

const GET_OR_CREATE_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
local value = redis.call('GET', KEYS[1])
tag_entry()
return tonumber(value)
";

const SET_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
tag_entry()
return 1
";

/// Adds to a counter and refreshes its expiry in one round trip.
const INCREMENT_SCRIPT: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
tag_entry()
return value
";

pub struct RedisStore {
    conn: ConnectionManager,
    get_or_create_script: Script,
    set_script: Script,
    increment_script: Script,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> SlowDownResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            SlowDownError::StoreUnavailable(format!("Failed to create Redis client: {}", e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            SlowDownError::StoreUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            conn,
            get_or_create_script: tagging_script(GET_OR_CREATE_SCRIPT),
            set_script: tagging_script(SET_SCRIPT),
            increment_script: tagging_script(INCREMENT_SCRIPT),
        })
    }

    fn entry_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    fn tag_key(tag: &str) -> String {
        format!("{}tag:{}", KEY_PREFIX, tag)
    }

    /// PX rejects zero, so expiries are at least one millisecond.
    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// KEYS for the tagging scripts: the entry first, then its tag sets.
    fn script_keys(key: &str, tags: &[String]) -> Vec<String> {
        std::iter::once(Self::entry_key(key))
            .chain(tags.iter().map(|tag| Self::tag_key(tag)))
            .collect()
    }

    fn remove_pipeline(key: &str, tags: &[String]) -> redis::Pipeline {
        let entry_key = Self::entry_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(&entry_key);
        for tag in tags {
            pipe.cmd("ZREM").arg(Self::tag_key(tag)).arg(&entry_key).ignore();
        }
        pipe
    }
}

fn tagging_script(body: &str) -> Script {
    Script::new(&format!("{}{}", TAG_ENTRY, body))
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_or_create(
        &self,
        key: &str,
        default: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64> {
        let mut conn = self.conn.clone();

        let value: Option<i64> = self
            .get_or_create_script
            .key(Self::script_keys(key, tags))
            .arg(default)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(default))
    }

    async fn set(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<()> {
        let mut conn = self.conn.clone();

        self.set_script
            .key(Self::script_keys(key, tags))
            .arg(value)
            .arg(Self::ttl_millis(ttl))
            .invoke_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str, tags: &[String]) -> SlowDownResult<bool> {
        let mut conn = self.conn.clone();
        let (deleted,): (i64,) = Self::remove_pipeline(key, tags)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn remove_by_tags(&self, tags: &[String]) -> SlowDownResult<usize> {
        let mut conn = self.conn.clone();
        let mut removed = 0;

        for tag in tags {
            let tag_key = Self::tag_key(tag);
            let members: Vec<String> = redis::cmd("ZRANGE")
                .arg(&tag_key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;

            if !members.is_empty() {
                let deleted: i64 = redis::cmd("DEL")
                    .arg(&members)
                    .query_async(&mut conn)
                    .await?;
                removed += usize::try_from(deleted).unwrap_or(0);
            }

            redis::cmd("DEL")
                .arg(&tag_key)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        Ok(removed)
    }

    async fn increment_and_get(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64> {
        let mut conn = self.conn.clone();

        let value: i64 = self
            .increment_script
            .key(Self::script_keys(key, tags))
            .arg(delta)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn time_to_live(&self, key: &str) -> SlowDownResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(Self::entry_key(key))
            .query_async(&mut conn)
            .await?;
        // -2 for a missing key, -1 for one without expiry
        Ok(u64::try_from(ttl)
            .ok()
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis))
    }

    async fn ping(&self) -> SlowDownResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
