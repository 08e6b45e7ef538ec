//! 消息服务

use super::PipelineCore;
use crate::broker::BrokerChannel;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::error::ApplicationResult;
use crate::permission::PermissionOracle;
use domain::{Action, ChatInfo, Message, WebhookEnvelope};
use std::sync::Arc;

pub struct MessageServiceDependencies {
    pub oracle: Arc<PermissionOracle>,
    pub channel: Arc<dyn BrokerChannel>,
    pub chats: Arc<Cache<ChatInfo>>,
    pub clock: Arc<dyn Clock>,
}

pub struct MessageService {
    core: PipelineCore,
    chats: Arc<Cache<ChatInfo>>,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self {
            core: PipelineCore::new(deps.oracle, deps.channel, deps.clock, "messages"),
            chats: deps.chats,
        }
    }

    /// 用户提交消息动作（插入/更新/删除）
    pub async fn submit(&self, user_id: &str, action: Action<Message>) -> ApplicationResult<()> {
        self.core.submit(user_id, action).await
    }

    /// 重放数据层变更触发器
    pub async fn replay_webhook(
        &self,
        envelope: &WebhookEnvelope<Message>,
    ) -> ApplicationResult<()> {
        self.core.replay(envelope).await
    }

    /// 切换某条消息的置顶状态，仅主持人可用；返回切换后的状态
    pub async fn toggle_pin(
        &self,
        user_id: &str,
        chat_id: &str,
        sid: &str,
    ) -> ApplicationResult<bool> {
        let chat = self.core.oracle().chat_info(chat_id).await?;
        self.core.oracle().ensure_moderator(user_id, &chat).await?;

        let mut pinned = false;
        self.chats
            .update(chat_id, chat, |mut c| {
                pinned = c.toggle_pin(sid);
                c
            })
            .await?;

        tracing::info!(chat_id, sid, pinned, "置顶状态已切换");
        Ok(pinned)
    }
}
