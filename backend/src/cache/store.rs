use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use crate::config::RedisSettings;
use crate::error::{PipelineError, PipelineResult};

/// Key-value store with per-key TTL plus the few atomic primitives the
/// pipeline needs for cross-instance coordination.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> PipelineResult<Option<String>>;

    /// `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PipelineResult<()>;

    /// Overwrites the value keeping whatever expiry the key already has.
    /// A missing key is created with `default_ttl`.
    async fn set_preserving_ttl(
        &self,
        key: &str,
        value: &str,
        default_ttl: Option<Duration>,
    ) -> PipelineResult<()>;

    /// Remaining TTL; `None` for a missing key or a key without expiry.
    async fn ttl(&self, key: &str) -> PipelineResult<Option<Duration>>;

    async fn delete(&self, key: &str) -> PipelineResult<bool>;

    /// Writes `value` only if the stored value still equals `expected`
    /// (`None` meaning the key must be absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> PipelineResult<bool>;

    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool>;

    /// Resets the lease expiry to `ttl` only if `owner` still holds it.
    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool>;

    /// Releases the lease only if `owner` still holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> PipelineResult<bool>;
}

static SET_PRESERVING_TTL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
  return redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
elseif ttl == -1 then
  return redis.call('SET', KEYS[1], ARGV[1])
elseif tonumber(ARGV[2]) > 0 then
  return redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
end
return redis.call('SET', KEYS[1], ARGV[1])
"#,
    )
});

static COMPARE_AND_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#,
    )
});

static RELEASE_LEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

static RENEW_LEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#,
    )
});

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| t.as_millis() as u64).unwrap_or(0)
}

/// Redis-backed store over a multiplexed async connection.
#[derive(Clone)]
pub struct RedisCacheStore {
    connection: MultiplexedConnection,
    command_timeout: Duration,
}

impl RedisCacheStore {
    pub async fn connect(settings: &RedisSettings) -> PipelineResult<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| PipelineError::CacheUnavailable(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PipelineError::CacheUnavailable(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected to Redis at {}", settings.url);
        Ok(Self {
            connection,
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
        })
    }

    async fn run<T, F>(&self, command: F) -> PipelineResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        timeout(self.command_timeout, command)
            .await
            .map_err(|_| PipelineError::CacheUnavailable("Redis command timeout".to_string()))?
            .map_err(PipelineError::from)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.run(redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run(cmd.query_async::<_, ()>(&mut conn)).await
    }

    async fn set_preserving_ttl(
        &self,
        key: &str,
        value: &str,
        default_ttl: Option<Duration>,
    ) -> PipelineResult<()> {
        let mut conn = self.connection.clone();
        let mut invocation = SET_PRESERVING_TTL.key(key);
        invocation.arg(value).arg(ttl_millis(default_ttl));
        self.run(invocation.invoke_async::<_, ()>(&mut conn)).await
    }

    async fn ttl(&self, key: &str) -> PipelineResult<Option<Duration>> {
        let mut conn = self.connection.clone();
        let millis: i64 = self.run(redis::cmd("PTTL").arg(key).query_async(&mut conn)).await?;
        Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn delete(&self, key: &str) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self.run(redis::cmd("DEL").arg(key).query_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = COMPARE_AND_SET.key(key);
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_millis(ttl));
        let swapped: i64 = self.run(invocation.invoke_async(&mut conn)).await?;
        Ok(swapped == 1)
    }

    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(owner)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = RENEW_LEASE.key(key);
        invocation.arg(owner).arg(ttl.as_millis() as u64);
        let renewed: i64 = self.run(invocation.invoke_async(&mut conn)).await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> PipelineResult<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = RELEASE_LEASE.key(key);
        invocation.arg(owner);
        let released: i64 = self.run(invocation.invoke_async(&mut conn)).await?;
        Ok(released == 1)
    }
}
