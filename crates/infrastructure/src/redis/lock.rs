//! Redis 分布式锁后端
//!
//! `SET key token NX PX ttl` 抢锁，Lua 脚本比对 token 后删除，保证只有
//! 持有者能释放自己的锁。

use crate::redis::error::RedisError;
use application::{ApplicationResult, LockBackend};
use redis::aio::ConnectionManager;
use std::time::Duration;

/// 比对 token 后删除，避免误删他人续期后的锁
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    connection: ConnectionManager,
    unlock_script: redis::Script,
}

impl RedisLockBackend {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
        }
    }
}

#[async_trait::async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> ApplicationResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        let _deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }
}
