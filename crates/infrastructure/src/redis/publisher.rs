//! presence 事件发布者
//!
//! 进入/离开事件发布到按列表的 Redis 频道 `<前缀><listId>`，由边缘网关
//! 订阅后推给客户端。事件是尽力而为的提示，调用方不依赖投递成功。

use crate::redis::error::RedisError;
use application::{ApplicationResult, PresenceEvent, PresenceEventPublisher};
use redis::aio::ConnectionManager;

pub struct RedisPresencePublisher {
    connection: ConnectionManager,
    channel_prefix: String,
}

impl RedisPresencePublisher {
    pub fn new(connection: ConnectionManager, channel_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            channel_prefix: channel_prefix.into(),
        }
    }
}

#[async_trait::async_trait]
impl PresenceEventPublisher for RedisPresencePublisher {
    async fn publish(&self, event: &PresenceEvent) -> ApplicationResult<()> {
        let channel = format!("{}{}", self.channel_prefix, event.list_id);
        let payload = serde_json::to_string(event).map_err(RedisError::from)?;

        let mut conn = self.connection.clone();
        let subscribers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        tracing::debug!(channel = %channel, subscribers, "presence 事件已发布");
        Ok(())
    }
}
