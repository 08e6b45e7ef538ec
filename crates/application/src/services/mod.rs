//! 业务服务
//!
//! 消息和表情回应共享同一条提交管线：校验、权限判定、服务端盖章、
//! 发布到消息代理。发布之后的一切（分发、落库）由消费者异步完成，
//! 提交调用在代理确认后即返回。

mod message_service;
mod reaction_service;

pub use message_service::{MessageService, MessageServiceDependencies};
pub use reaction_service::{ReactionService, ReactionServiceDependencies};

use crate::broker::BrokerChannel;
use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::permission::PermissionOracle;
use crate::record::Record;
use domain::{Action, ActionOp, WebhookEnvelope, WebhookOp};
use std::sync::Arc;

/// 两个服务共用的提交管线
pub(crate) struct PipelineCore {
    oracle: Arc<PermissionOracle>,
    channel: Arc<dyn BrokerChannel>,
    clock: Arc<dyn Clock>,
    domain_name: &'static str,
}

impl PipelineCore {
    pub(crate) fn new(
        oracle: Arc<PermissionOracle>,
        channel: Arc<dyn BrokerChannel>,
        clock: Arc<dyn Clock>,
        domain_name: &'static str,
    ) -> Self {
        Self {
            oracle,
            channel,
            clock,
            domain_name,
        }
    }

    pub(crate) fn oracle(&self) -> &PermissionOracle {
        &self.oracle
    }

    /// 用户提交一个动作
    pub(crate) async fn submit<T: Record>(
        &self,
        user_id: &str,
        mut action: Action<T>,
    ) -> ApplicationResult<()> {
        action.data.validate()?;

        let chat = self.oracle.chat_info(action.data.chat_id()).await?;
        match action.op {
            ActionOp::Insert => {
                // 插入只能以自己的身份发布
                if action.data.author_id() != user_id {
                    return Err(ApplicationError::PermissionDenied);
                }
                self.oracle.ensure_can_publish(user_id, &chat).await?;
                action.data.stamp_created(self.clock.now());
            }
            ActionOp::Update => {
                self.oracle
                    .ensure_can_mutate(user_id, action.data.author_id(), &chat)
                    .await?;
                action.data.stamp_updated(self.clock.now());
            }
            ActionOp::Delete => {
                self.oracle
                    .ensure_can_mutate(user_id, action.data.author_id(), &chat)
                    .await?;
                action.data.stamp_updated(self.clock.now());
            }
        }

        self.publish(&action).await
    }

    /// 重放数据层变更触发器（可信来源，跳过权限判定与盖章）
    pub(crate) async fn replay<T: Record>(
        &self,
        envelope: &WebhookEnvelope<T>,
    ) -> ApplicationResult<()> {
        let record = envelope.effective_record().ok_or_else(|| {
            ApplicationError::Validation("触发器信封不含有效记录".to_string())
        })?;

        let op = match envelope.event.op {
            WebhookOp::Insert | WebhookOp::Manual => ActionOp::Insert,
            WebhookOp::Update => ActionOp::Update,
            WebhookOp::Delete => ActionOp::Delete,
        };

        tracing::info!(
            domain = self.domain_name,
            trigger = envelope.trigger.name,
            op = %op,
            sid = record.sid(),
            "重放数据层变更"
        );
        self.publish(&Action::new(op, record.clone())).await
    }

    async fn publish<T: Record>(&self, action: &Action<T>) -> ApplicationResult<()> {
        let payload = serde_json::to_vec(action)
            .map_err(|e| ApplicationError::infrastructure_with_source("动作序列化失败", e))?;
        self.channel
            .publish(action.data.chat_id(), &payload)
            .await?;

        tracing::debug!(
            domain = self.domain_name,
            op = %action.op,
            sid = action.data.sid(),
            chat_id = action.data.chat_id(),
            "动作已发布"
        );
        Ok(())
    }
}
