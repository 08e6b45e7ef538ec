//! Redis 缓存条目存储
//!
//! 条目是字符串键下的 JSON，带过期时间。set-if-absent 用 `SET NX PX`，
//! 与缓存层"先写入者获胜"的约定对应。

use crate::redis::error::RedisError;
use application::{ApplicationResult, CacheStore};
use redis::aio::ConnectionManager;
use std::time::Duration;

pub struct RedisCacheStore {
    connection: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> ApplicationResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> ApplicationResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(expiry.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, expiry: Duration) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(expiry.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }
}
