//! 权限判定
//!
//! 判定只依赖两份缓存值：用户授权集合和聊天室元数据。缓存命中永不过期，
//! 因此刚刚授予的权限可能尚未出现在缓存里——对"缺失关联"的判定在拒绝
//! 之前强制刷新一次对应条目（刷新本身受缓存限速约束），把新授权的生效
//! 延迟压到一个限速窗口之内。拒绝是静默的：只返回错误，不提示原因细节。

use crate::cache::Cache;
use crate::error::{ApplicationError, ApplicationResult};
use domain::{ChatInfo, UserGrants};
use std::sync::Arc;

pub struct PermissionOracle {
    grants: Arc<Cache<UserGrants>>,
    chats: Arc<Cache<ChatInfo>>,
}

impl PermissionOracle {
    pub fn new(grants: Arc<Cache<UserGrants>>, chats: Arc<Cache<ChatInfo>>) -> Self {
        Self { grants, chats }
    }

    /// 查询聊天室元数据，未知聊天室视为数据错误而不是权限问题
    pub async fn chat_info(&self, chat_id: &str) -> ApplicationResult<ChatInfo> {
        self.chats
            .get(chat_id, None, false)
            .await?
            .ok_or_else(|| ApplicationError::PersistentData(format!("未知聊天室: {chat_id}")))
    }

    /// 用户是否可见该聊天室：公开房间要求会议关联，非公开房间额外要求
    /// 成员资格或主持人角色
    pub async fn ensure_can_access(&self, user_id: &str, chat: &ChatInfo) -> ApplicationResult<()> {
        let grants = self.grants_for(user_id, &chat.conference_id).await?;

        if chat.is_public || chat.has_member(user_id) || grants.is_moderator(&chat.conference_id) {
            return Ok(());
        }

        // 成员列表可能落后于刚完成的拉人操作，拒绝前强制刷新一次
        let refreshed = self.chats.get(&chat.id, None, true).await?;
        match refreshed {
            Some(chat) if chat.has_member(user_id) => Ok(()),
            _ => Err(ApplicationError::PermissionDenied),
        }
    }

    /// 用户是否可在该聊天室发布动作
    pub async fn ensure_can_publish(&self, user_id: &str, chat: &ChatInfo) -> ApplicationResult<()> {
        self.ensure_can_access(user_id, chat).await
    }

    /// 用户是否可变更一条记录：作者可改自己的，主持人可改任何人的
    pub async fn ensure_can_mutate(
        &self,
        user_id: &str,
        author_id: &str,
        chat: &ChatInfo,
    ) -> ApplicationResult<()> {
        self.ensure_can_access(user_id, chat).await?;
        if user_id == author_id {
            return Ok(());
        }
        self.ensure_moderator(user_id, chat).await
    }

    /// 要求主持人角色（置顶等管理操作）
    pub async fn ensure_moderator(&self, user_id: &str, chat: &ChatInfo) -> ApplicationResult<()> {
        let grants = self.grants_for(user_id, &chat.conference_id).await?;
        if grants.is_moderator(&chat.conference_id) {
            Ok(())
        } else {
            Err(ApplicationError::PermissionDenied)
        }
    }

    /// 读取用户授权集合，要求与目标会议存在关联
    ///
    /// 首次读取未见关联时强制刷新一次再判定；仍无关联才拒绝。
    async fn grants_for(&self, user_id: &str, conference_id: &str) -> ApplicationResult<UserGrants> {
        if let Some(grants) = self.grants.get(user_id, None, false).await? {
            if grants.has_conference(conference_id) {
                return Ok(grants);
            }
        }

        tracing::debug!(user_id, conference_id, "授权关联缺失，强制刷新后重试");
        match self.grants.get(user_id, None, true).await? {
            Some(grants) if grants.has_conference(conference_id) => Ok(grants),
            _ => Err(ApplicationError::PermissionDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheStore;
    use crate::cache::{CacheOptions, Fetcher};
    use crate::clock::manual::ManualClock;
    use crate::lock::memory::MemoryLockBackend;
    use crate::lock::{LockConfig, LockManager};
    use chrono::Utc;
    use domain::{ConferenceGrant, GrantRole};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct GrantsFetcher {
        calls: AtomicU32,
        value: Mutex<Option<UserGrants>>,
    }

    #[async_trait::async_trait]
    impl Fetcher<UserGrants> for GrantsFetcher {
        async fn fetch(&self, _key: &str) -> ApplicationResult<Option<UserGrants>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.lock().await.clone())
        }
    }

    struct ChatFetcher {
        value: Option<ChatInfo>,
    }

    #[async_trait::async_trait]
    impl Fetcher<ChatInfo> for ChatFetcher {
        async fn fetch(&self, _key: &str) -> ApplicationResult<Option<ChatInfo>> {
            Ok(self.value.clone())
        }
    }

    fn grants_of(user_id: &str, conference_id: &str, role: GrantRole) -> UserGrants {
        UserGrants {
            user_id: user_id.to_string(),
            grants: vec![ConferenceGrant {
                conference_id: conference_id.to_string(),
                role,
            }],
        }
    }

    fn public_chat() -> ChatInfo {
        ChatInfo {
            id: "c1".to_string(),
            conference_id: "conf1".to_string(),
            is_public: true,
            member_ids: vec![],
            pinned_sids: vec![],
        }
    }

    fn private_chat(members: &[&str]) -> ChatInfo {
        ChatInfo {
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            is_public: false,
            ..public_chat()
        }
    }

    struct Fixture {
        oracle: PermissionOracle,
        grants_fetcher: Arc<GrantsFetcher>,
        clock: Arc<ManualClock>,
    }

    fn fixture(grants: Option<UserGrants>, chat: Option<ChatInfo>) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()), LockConfig::default());
        let grants_fetcher = Arc::new(GrantsFetcher {
            calls: AtomicU32::new(0),
            value: Mutex::new(grants),
        });

        let grants_cache = Cache::new(
            Arc::new(MemoryCacheStore::new()),
            locks.clone(),
            grants_fetcher.clone(),
            clock.clone(),
            CacheOptions::new("grants"),
        );
        let chats_cache = Cache::new(
            Arc::new(MemoryCacheStore::new()),
            locks,
            Arc::new(ChatFetcher { value: chat }),
            clock.clone(),
            CacheOptions::new("chats"),
        );

        Fixture {
            oracle: PermissionOracle::new(Arc::new(grants_cache), Arc::new(chats_cache)),
            grants_fetcher,
            clock,
        }
    }

    #[tokio::test]
    async fn test_attendee_can_access_public_chat() {
        let f = fixture(
            Some(grants_of("u1", "conf1", GrantRole::Attendee)),
            Some(public_chat()),
        );
        let chat = f.oracle.chat_info("c1").await.unwrap();
        assert!(f.oracle.ensure_can_access("u1", &chat).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_conference_is_denied_after_forced_refresh() {
        let f = fixture(
            Some(grants_of("u1", "other-conf", GrantRole::Attendee)),
            Some(public_chat()),
        );
        let chat = f.oracle.chat_info("c1").await.unwrap();

        let result = f.oracle.ensure_can_access("u1", &chat).await;
        assert!(matches!(result, Err(ApplicationError::PermissionDenied)));
        // 首次回源 + 拒绝前的一次强制刷新尝试（限速窗口内不触发第二次回源）
        assert_eq!(f.grants_fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_grant_found_via_forced_refresh() {
        let f = fixture(None, Some(public_chat()));
        let chat = f.oracle.chat_info("c1").await.unwrap();

        // 先缓存进哨兵条目
        assert!(f.oracle.ensure_can_access("u1", &chat).await.is_err());

        // 上游出现了新授权，窗口过后强制刷新应能看到它
        *f.grants_fetcher.value.lock().await = Some(grants_of("u1", "conf1", GrantRole::Attendee));
        f.clock.advance_millis(31_000);
        assert!(f.oracle.ensure_can_access("u1", &chat).await.is_ok());
    }

    #[tokio::test]
    async fn test_private_chat_requires_membership() {
        let f = fixture(
            Some(grants_of("u1", "conf1", GrantRole::Attendee)),
            Some(private_chat(&["u2"])),
        );
        let chat = f.oracle.chat_info("c1").await.unwrap();

        assert!(matches!(
            f.oracle.ensure_can_access("u1", &chat).await,
            Err(ApplicationError::PermissionDenied)
        ));
        assert!(f.oracle.ensure_can_access("u2", &chat).await.is_ok());
    }

    #[tokio::test]
    async fn test_moderator_can_mutate_others_records() {
        let f = fixture(
            Some(grants_of("mod", "conf1", GrantRole::Moderator)),
            Some(public_chat()),
        );
        let chat = f.oracle.chat_info("c1").await.unwrap();

        assert!(f.oracle.ensure_can_mutate("mod", "u1", &chat).await.is_ok());
    }

    #[tokio::test]
    async fn test_attendee_cannot_mutate_others_records() {
        let f = fixture(
            Some(grants_of("u1", "conf1", GrantRole::Attendee)),
            Some(public_chat()),
        );
        let chat = f.oracle.chat_info("c1").await.unwrap();

        assert!(f.oracle.ensure_can_mutate("u1", "u1", &chat).await.is_ok());
        assert!(matches!(
            f.oracle.ensure_can_mutate("u1", "u2", &chat).await,
            Err(ApplicationError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_unknown_chat_is_data_error() {
        let f = fixture(Some(grants_of("u1", "conf1", GrantRole::Attendee)), None);
        assert!(matches!(
            f.oracle.chat_info("missing").await,
            Err(ApplicationError::PersistentData(_))
        ));
    }
}
