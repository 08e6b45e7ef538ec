//! Redis 在线状态集合存储
//!
//! 三组集合加一个全局注册表哈希：
//! - `PresenceList:<listId>`（SET）
//! - `UserSessions:<listId>:<userId>`（SET）
//! - `SessionLists:<sessionId>`（SET）
//! - `PresenceSessions`（HASH，会话 -> 用户）
//!
//! 空闲用户的条件移除用 Lua 脚本在服务端原子完成：观察基数和移除之间
//! 没有窗口，调用方的乐观重试循环在这个后端上不会触发冲突分支。

use crate::redis::error::RedisError;
use application::{ApplicationResult, PresenceStore, ReconcileOutcome};
use redis::aio::ConnectionManager;

const REGISTRY_KEY: &str = "PresenceSessions";

/// SCARD 为零时才移除在线标记；-1 = 仍有会话，1 = 已移除，0 = 本就不在
const REMOVE_IF_IDLE_SCRIPT: &str = r#"
if redis.call("SCARD", KEYS[1]) == 0 then
    return redis.call("SREM", KEYS[2], ARGV[1])
else
    return -1
end
"#;

pub struct RedisPresenceStore {
    connection: ConnectionManager,
    remove_if_idle: redis::Script,
}

impl RedisPresenceStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            remove_if_idle: redis::Script::new(REMOVE_IF_IDLE_SCRIPT),
        }
    }

    fn presence_key(list_id: &str) -> String {
        format!("PresenceList:{}", list_id)
    }

    fn user_sessions_key(list_id: &str, user_id: &str) -> String {
        format!("UserSessions:{}:{}", list_id, user_id)
    }

    fn session_lists_key(session_id: &str) -> String {
        format!("SessionLists:{}", session_id)
    }
}

#[async_trait::async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_user_session(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<(bool, u64)> {
        let key = Self::user_sessions_key(list_id, user_id);
        let mut conn = self.connection.clone();
        let (added, cardinality): (i64, u64) = redis::pipe()
            .atomic()
            .sadd(&key, session_id)
            .scard(&key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok((added == 1, cardinality))
    }

    async fn add_session_list(&self, session_id: &str, list_id: &str) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SADD")
            .arg(Self::session_lists_key(session_id))
            .arg(list_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn add_presence(&self, list_id: &str, user_id: &str) -> ApplicationResult<bool> {
        let mut conn = self.connection.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(Self::presence_key(list_id))
            .arg(user_id)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(added == 1)
    }

    async fn remove_user_session(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SREM")
            .arg(Self::user_sessions_key(list_id, user_id))
            .arg(session_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn remove_session_list(&self, session_id: &str, list_id: &str) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SREM")
            .arg(Self::session_lists_key(session_id))
            .arg(list_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn remove_presence_if_idle(
        &self,
        list_id: &str,
        user_id: &str,
    ) -> ApplicationResult<ReconcileOutcome> {
        let mut conn = self.connection.clone();
        let result: i64 = self
            .remove_if_idle
            .key(Self::user_sessions_key(list_id, user_id))
            .key(Self::presence_key(list_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        Ok(match result {
            -1 => ReconcileOutcome::UserStillActive,
            1 => ReconcileOutcome::Removed,
            _ => ReconcileOutcome::NotMember,
        })
    }

    async fn session_lists(&self, session_id: &str) -> ApplicationResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let lists: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::session_lists_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(lists)
    }

    async fn presence_members(&self, list_id: &str) -> ApplicationResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::presence_key(list_id))
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(members)
    }

    async fn register_session(&self, session_id: &str, user_id: &str) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("HSET")
            .arg(REGISTRY_KEY)
            .arg(session_id)
            .arg(user_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn unregister_session(&self, session_id: &str) -> ApplicationResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("HDEL")
            .arg(REGISTRY_KEY)
            .arg(session_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn registered_sessions(&self) -> ApplicationResult<Vec<(String, String)>> {
        let mut conn = self.connection.clone();
        let entries: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(REGISTRY_KEY)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(entries)
    }
}
