//! Redis 实时传输适配
//!
//! 房间广播发布到 `room:<roomId>` 频道，由持有 WebSocket 连接的边缘
//! 网关订阅转发。存活连接集合来自网关维护的心跳键
//! `SessionAlive:<sessionId>`（带 TTL）：网关崩溃后心跳键过期，悬挂
//! 会话清理据此识别已死连接。

use crate::redis::error::RedisError;
use application::{ApplicationResult, LiveTransport};
use redis::aio::ConnectionManager;
use std::collections::HashSet;

const ALIVE_KEY_PREFIX: &str = "SessionAlive:";

pub struct RedisLiveTransport {
    connection: ConnectionManager,
    room_channel_prefix: String,
}

impl RedisLiveTransport {
    pub fn new(connection: ConnectionManager, room_channel_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            room_channel_prefix: room_channel_prefix.into(),
        }
    }
}

#[async_trait::async_trait]
impl LiveTransport for RedisLiveTransport {
    async fn broadcast_to_room(
        &self,
        room_id: &str,
        payload: &serde_json::Value,
    ) -> ApplicationResult<()> {
        let channel = format!("{}{}", self.room_channel_prefix, room_id);
        let body = serde_json::to_string(payload).map_err(RedisError::from)?;

        let mut conn = self.connection.clone();
        let subscribers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        tracing::debug!(channel = %channel, subscribers, "房间广播已发布");
        Ok(())
    }

    async fn live_sessions(&self) -> ApplicationResult<HashSet<String>> {
        let mut conn = self.connection.clone();
        let mut sessions = HashSet::new();
        let mut cursor: u64 = 0;

        // 残缺的集合会让清理误杀活连接，任何一轮扫描失败都整体报错
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", ALIVE_KEY_PREFIX))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(RedisError::from)?;

            for key in keys {
                if let Some(session_id) = key.strip_prefix(ALIVE_KEY_PREFIX) {
                    sessions.insert(session_id.to_string());
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(sessions)
    }
}
