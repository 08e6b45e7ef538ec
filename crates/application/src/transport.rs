//! 实时传输抽象
//!
//! 分发消费者通过这里把动作推给聊天室内的在线连接；在线状态对账需要
//! 知道本实例当前存活的连接集合。具体实现由接入层（WebSocket 网关）
//! 提供。

use crate::error::ApplicationResult;
use std::collections::HashSet;

#[async_trait::async_trait]
pub trait LiveTransport: Send + Sync {
    /// 向聊天室内所有在线连接广播一条动作
    async fn broadcast_to_room(
        &self,
        room_id: &str,
        payload: &serde_json::Value,
    ) -> ApplicationResult<()>;

    /// 当前存活的连接标识集合；失败时调用方应放弃本轮悬挂会话清理，
    /// 宁可漏清不可误清
    async fn live_sessions(&self) -> ApplicationResult<HashSet<String>>;
}

/// 内存实现的实时传输（测试用），记录广播历史
pub mod memory {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        broadcasts: Mutex<Vec<(String, serde_json::Value)>>,
        sessions: Mutex<HashSet<String>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn broadcasts(&self) -> Vec<(String, serde_json::Value)> {
            self.broadcasts.lock().await.clone()
        }

        pub async fn set_sessions(&self, sessions: impl IntoIterator<Item = String>) {
            *self.sessions.lock().await = sessions.into_iter().collect();
        }
    }

    #[async_trait::async_trait]
    impl LiveTransport for RecordingTransport {
        async fn broadcast_to_room(
            &self,
            room_id: &str,
            payload: &serde_json::Value,
        ) -> ApplicationResult<()> {
            self.broadcasts
                .lock()
                .await
                .push((room_id.to_string(), payload.clone()));
            Ok(())
        }

        async fn live_sessions(&self) -> ApplicationResult<HashSet<String>> {
            Ok(self.sessions.lock().await.clone())
        }
    }
}
