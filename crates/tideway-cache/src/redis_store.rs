//! Redis implementation of [`RemoteStore`] on a deadpool connection pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime};
use serde_json::Value;
use tideway_core::{Error, Result};

use crate::codec::RawValue;
use crate::store::RemoteStore;

/// Server-side compare-and-swap.
///
/// ARGV: `[has_expected ("0"|"1"), expected, new_value, ttl_ms]`.
/// Returns 1 when the value was replaced, 0 otherwise.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
    cas: redis::Script,
}

impl RedisStore {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            cas: redis::Script::new(COMPARE_AND_SWAP),
        }
    }

    /// Build a pool for `url`. No connection is made until first use, so a
    /// Redis outage at startup degrades to fail-open instead of aborting.
    pub fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Self> {
        let mut config = deadpool_redis::Config::from_url(url);
        let mut pool_config = PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::unreachable("redis", format!("failed to create pool: {e}")))?;
        Ok(Self::new(pool, timeout))
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::unreachable(
                "redis",
                format!("{op} timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::unreachable("redis", format!("failed to get connection: {e}")))
    }
}

fn command_error(op: &'static str, err: redis::RedisError) -> Error {
    Error::unreachable("redis", format!("{op} failed: {err}"))
}

/// Map a Redis reply onto the codec's input shape.
pub(crate) fn raw_from_reply(reply: redis::Value) -> RawValue {
    match reply {
        redis::Value::Nil => RawValue::Nil,
        redis::Value::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(text) => RawValue::Text(text),
            Err(e) => RawValue::Unsupported(format!(
                "binary payload ({} bytes)",
                e.as_bytes().len()
            )),
        },
        redis::Value::SimpleString(text) => RawValue::Text(text),
        other => match structured(&other) {
            Some(value) => RawValue::Structured(value),
            None => RawValue::Unsupported(format!("{other:?}")),
        },
    }
}

fn structured(reply: &redis::Value) -> Option<Value> {
    match reply {
        redis::Value::Nil => Some(Value::Null),
        redis::Value::Int(n) => Some(Value::from(*n)),
        redis::Value::Boolean(b) => Some(Value::Bool(*b)),
        redis::Value::Double(d) => serde_json::Number::from_f64(*d).map(Value::Number),
        redis::Value::SimpleString(s) => Some(Value::String(s.clone())),
        redis::Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .map(|s| Value::String(s.to_string())),
        redis::Value::Array(items) => items
            .iter()
            .map(structured)
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        redis::Value::Map(pairs) => {
            let mut map = serde_json::Map::new();
            for (k, v) in pairs {
                let Some(Value::String(k)) = structured(k) else {
                    return None;
                };
                map.insert(k, structured(v)?);
            }
            Some(Value::Object(map))
        }
        _ => None,
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<RawValue> {
        self.bounded("GET", async {
            let mut conn = self.connection().await?;
            let reply: redis::RedisResult<redis::Value> =
                redis::cmd("GET").arg(key).query_async(&mut conn).await;
            match reply {
                Ok(reply) => Ok(raw_from_reply(reply)),
                Err(e) if e.code() == Some("WRONGTYPE") => {
                    Ok(RawValue::Unsupported("non-string redis type".to_string()))
                }
                Err(e) => Err(command_error("GET", e)),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.bounded("SET", async {
            let mut conn = self.connection().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let _: () = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("SET", e))?;
            tracing::debug!(key = %key, "cache set");
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.bounded("SET NX", async {
            let mut conn = self.connection().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let reply: redis::Value = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("SET NX", e))?;
            Ok(matches!(
                reply,
                redis::Value::Okay | redis::Value::SimpleString(_)
            ))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.bounded("DEL", async {
            let mut conn = self.connection().await?;
            let removed: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("DEL", e))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.bounded("CAS", async {
            let mut conn = self.connection().await?;
            let has_expected = if expected.is_some() { "1" } else { "0" };
            let swapped: i64 = self
                .cas
                .key(key)
                .arg(has_expected)
                .arg(expected.unwrap_or(""))
                .arg(value)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| command_error("CAS", e))?;
            Ok(swapped == 1)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("PING", async {
            let mut conn = self.connection().await?;
            let _: redis::Value = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("PING", e))?;
            Ok(())
        })
        .await
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
