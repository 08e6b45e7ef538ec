//! 表情回应服务

use super::PipelineCore;
use crate::broker::BrokerChannel;
use crate::clock::Clock;
use crate::error::ApplicationResult;
use crate::permission::PermissionOracle;
use domain::{Action, Reaction, WebhookEnvelope};
use std::sync::Arc;

pub struct ReactionServiceDependencies {
    pub oracle: Arc<PermissionOracle>,
    pub channel: Arc<dyn BrokerChannel>,
    pub clock: Arc<dyn Clock>,
}

pub struct ReactionService {
    core: PipelineCore,
}

impl ReactionService {
    pub fn new(deps: ReactionServiceDependencies) -> Self {
        Self {
            core: PipelineCore::new(deps.oracle, deps.channel, deps.clock, "reactions"),
        }
    }

    /// 用户提交回应动作（插入/删除，更新对回应没有意义但管线不禁止）
    pub async fn submit(&self, user_id: &str, action: Action<Reaction>) -> ApplicationResult<()> {
        self.core.submit(user_id, action).await
    }

    /// 重放数据层变更触发器
    pub async fn replay_webhook(
        &self,
        envelope: &WebhookEnvelope<Reaction>,
    ) -> ApplicationResult<()> {
        self.core.replay(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerChannel, ConsumerRole};
    use crate::cache::memory::MemoryCacheStore;
    use crate::cache::{Cache, CacheOptions, Fetcher};
    use crate::clock::manual::ManualClock;
    use crate::error::ApplicationError;
    use crate::lock::memory::MemoryLockBackend;
    use crate::lock::{LockConfig, LockManager};
    use chrono::Utc;
    use domain::{ChatInfo, ConferenceGrant, GrantRole, UserGrants};

    struct StaticFetcher<T: Clone>(Option<T>);

    #[async_trait::async_trait]
    impl<T: Clone + Send + Sync + 'static> Fetcher<T> for StaticFetcher<T> {
        async fn fetch(&self, _key: &str) -> ApplicationResult<Option<T>> {
            Ok(self.0.clone())
        }
    }

    fn reaction(sid: &str, user_id: &str) -> Reaction {
        Reaction {
            id: None,
            sid: sid.to_string(),
            chat_id: "c1".to_string(),
            message_sid: "m1".to_string(),
            user_id: user_id.to_string(),
            kind: "+1".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    async fn service() -> (ReactionService, Arc<MemoryBroker>) {
        let clock = ManualClock::new(Utc::now());
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()), LockConfig::default());

        let chat = ChatInfo {
            id: "c1".to_string(),
            conference_id: "conf1".to_string(),
            is_public: true,
            member_ids: vec![],
            pinned_sids: vec![],
        };
        let grants = UserGrants {
            user_id: "u1".to_string(),
            grants: vec![ConferenceGrant {
                conference_id: "conf1".to_string(),
                role: GrantRole::Attendee,
            }],
        };

        let chats = Arc::new(Cache::new(
            Arc::new(MemoryCacheStore::new()),
            locks.clone(),
            Arc::new(StaticFetcher(Some(chat))),
            clock.clone(),
            CacheOptions::new("chats"),
        ));
        let grants_cache = Arc::new(Cache::new(
            Arc::new(MemoryCacheStore::new()),
            locks,
            Arc::new(StaticFetcher(Some(grants))),
            clock.clone(),
            CacheOptions::new("grants"),
        ));

        let broker = Arc::new(MemoryBroker::new());
        let service = ReactionService::new(ReactionServiceDependencies {
            oracle: Arc::new(PermissionOracle::new(grants_cache, chats)),
            channel: broker.clone(),
            clock,
        });
        (service, broker)
    }

    #[tokio::test]
    async fn test_submit_reaction_publishes() {
        let (service, broker) = service().await;
        let mut rx = broker.subscribe(ConsumerRole::Writeback).await.unwrap();

        service
            .submit("u1", Action::insert(reaction("r1", "u1")))
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        let published: Action<Reaction> = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(published.data.sid, "r1");
        assert_eq!(published.data.message_sid, "m1");
    }

    #[tokio::test]
    async fn test_cannot_delete_others_reaction() {
        let (service, _broker) = service().await;

        let result = service
            .submit("u1", Action::delete(reaction("r1", "u2")))
            .await;
        assert!(matches!(result, Err(ApplicationError::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_invalid_reaction_rejected() {
        let (service, _broker) = service().await;

        let mut r = reaction("r1", "u1");
        r.kind = String::new();
        let result = service.submit("u1", Action::insert(r)).await;
        assert!(matches!(result, Err(ApplicationError::Validation(_))));
    }
}
