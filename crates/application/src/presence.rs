//! 分布式在线状态跟踪
//!
//! 以 (列表, 用户, 会话) 三元组维护三组关联集合：
//! - `PresenceList:<listId>`：列表内在线的用户
//! - `UserSessions:<listId>:<userId>`：该用户在该列表内的会话，基数是
//!   用户是否"在线"的唯一事实来源
//! - `SessionLists:<sessionId>`：会话占用的列表，断连时据此全部释放
//!
//! 进入/退出都先锁 `UserSessions` 再锁 `SessionLists`（固定顺序防死锁），
//! 并且先变更 `UserSessions` 再变更 `SessionLists`。退出路径不二次持锁，
//! 改用乐观的条件写对账循环，降低热路径上的锁竞争。

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::lock::LockManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// 对账单次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 用户仍有活跃会话，无需移除
    UserStillActive,
    /// 已从在线列表移除（成员关系确实发生了变化）
    Removed,
    /// 用户本就不在在线列表中
    NotMember,
    /// 并发写入者干扰，条件写被打断
    Conflict,
}

/// 在线状态集合存储
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    /// 把会话加入 `UserSessions`，返回 (是否新增, 加入后的基数)
    async fn add_user_session(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<(bool, u64)>;

    /// 把列表加入 `SessionLists`
    async fn add_session_list(&self, session_id: &str, list_id: &str) -> ApplicationResult<()>;

    /// 把用户加入 `PresenceList`，返回是否为新增成员
    async fn add_presence(&self, list_id: &str, user_id: &str) -> ApplicationResult<bool>;

    async fn remove_user_session(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<()>;

    async fn remove_session_list(&self, session_id: &str, list_id: &str) -> ApplicationResult<()>;

    /// 乐观的单次对账尝试：观察 `UserSessions` 基数，若为零则条件移除
    /// 用户的在线标记；观察窗口内有并发写入时返回 `Conflict`
    async fn remove_presence_if_idle(
        &self,
        list_id: &str,
        user_id: &str,
    ) -> ApplicationResult<ReconcileOutcome>;

    async fn session_lists(&self, session_id: &str) -> ApplicationResult<Vec<String>>;

    async fn presence_members(&self, list_id: &str) -> ApplicationResult<Vec<String>>;

    /// 全局会话注册表：会话 -> 用户，用于崩溃后识别悬挂会话
    async fn register_session(&self, session_id: &str, user_id: &str) -> ApplicationResult<()>;

    async fn unregister_session(&self, session_id: &str) -> ApplicationResult<()>;

    async fn registered_sessions(&self) -> ApplicationResult<Vec<(String, String)>>;
}

/// 进入/离开事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub list_id: String,
    pub user_id: String,
    pub kind: PresenceEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Entered,
    Left,
}

/// 事件发布通道（按列表的 pub/sub 频道）
#[async_trait::async_trait]
pub trait PresenceEventPublisher: Send + Sync {
    async fn publish(&self, event: &PresenceEvent) -> ApplicationResult<()>;
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub lock_ttl: Duration,
    /// 乐观对账的最大尝试次数
    pub max_reconcile_attempts: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            max_reconcile_attempts: 5,
        }
    }
}

/// 在线状态跟踪器
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    locks: LockManager,
    events: Arc<dyn PresenceEventPublisher>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        locks: LockManager,
        events: Arc<dyn PresenceEventPublisher>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            clock,
            config,
        }
    }

    fn user_sessions_lock_key(list_id: &str, user_id: &str) -> String {
        format!("UserSessions:{}:{}", list_id, user_id)
    }

    fn session_lists_lock_key(session_id: &str) -> String {
        format!("SessionLists:{}", session_id)
    }

    /// 会话进入列表
    ///
    /// 重复进入（已是成员）是静默的 no-op。锁获取失败时整个操作中止并
    /// 返回错误，不会有半完成的集合变更。
    pub async fn enter(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<()> {
        let entered = self
            .with_pair_locks(list_id, user_id, session_id, async {
                let (added, card_after) = self
                    .store
                    .add_user_session(list_id, user_id, session_id)
                    .await?;
                self.store.add_session_list(session_id, list_id).await?;

                // 只有"无会话 -> 有会话"的跃迁才可能产生 entered 事件
                if added && card_after == 1 {
                    return self.store.add_presence(list_id, user_id).await;
                }
                Ok(false)
            })
            .await?;

        if entered {
            self.publish(list_id, user_id, PresenceEventKind::Entered).await;
        }
        Ok(())
    }

    /// 会话退出列表
    ///
    /// 集合移除在锁内完成；随后不持锁地做乐观对账：若用户已无会话则
    /// 条件移除在线标记。对账重试耗尽说明存在无法调和的并发写入者，
    /// 作为错误向上传播。
    pub async fn exit(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> ApplicationResult<()> {
        self.with_pair_locks(list_id, user_id, session_id, async {
            self.store
                .remove_user_session(list_id, user_id, session_id)
                .await?;
            self.store.remove_session_list(session_id, list_id).await?;
            Ok(())
        })
        .await?;

        for _attempt in 1..=self.config.max_reconcile_attempts {
            match self.store.remove_presence_if_idle(list_id, user_id).await? {
                ReconcileOutcome::UserStillActive | ReconcileOutcome::NotMember => return Ok(()),
                ReconcileOutcome::Removed => {
                    self.publish(list_id, user_id, PresenceEventKind::Left).await;
                    return Ok(());
                }
                ReconcileOutcome::Conflict => continue,
            }
        }

        Err(ApplicationError::Conflict(format!(
            "presence 对账重试耗尽: list={} user={}",
            list_id, user_id
        )))
    }

    /// 释放会话占用的所有列表
    ///
    /// 逐列表退出并累积错误，不在第一个错误处中止；只要有一个失败就
    /// 返回一个合并的错误，并保留注册表条目，留给下一轮悬挂会话清理
    /// 重试。断连处理和悬挂会话清理都走这里。
    pub async fn exit_all(&self, session_id: &str, user_id: &str) -> ApplicationResult<()> {
        let lists = self.store.session_lists(session_id).await?;

        let mut failures = Vec::new();
        for list_id in &lists {
            if let Err(err) = self.exit(list_id, user_id, session_id).await {
                tracing::warn!(
                    list_id = %list_id,
                    session_id = %session_id,
                    error = %err,
                    "退出列表失败"
                );
                failures.push(format!("{}: {}", list_id, err));
            }
        }

        if failures.is_empty() {
            self.store.unregister_session(session_id).await?;
            Ok(())
        } else {
            Err(ApplicationError::Conflict(format!(
                "会话 {} 有 {}/{} 个列表退出失败: [{}]",
                session_id,
                failures.len(),
                lists.len(),
                failures.join("; ")
            )))
        }
    }

    /// 会话建立时登记到全局注册表
    pub async fn register(&self, session_id: &str, user_id: &str) -> ApplicationResult<()> {
        self.store.register_session(session_id, user_id).await
    }

    /// 清理悬挂会话
    ///
    /// 注册表与全进程实时连接集合做差：注册过但已无活跃连接的会话逐个
    /// `exit_all`。用于启动时的崩溃恢复和周期性巡检。返回清理数量。
    pub async fn reconcile_dangling(
        &self,
        live_sessions: &HashSet<String>,
    ) -> ApplicationResult<usize> {
        let registered = self.store.registered_sessions().await?;
        let mut cleaned = 0;

        for (session_id, user_id) in registered {
            if live_sessions.contains(&session_id) {
                continue;
            }
            match self.exit_all(&session_id, &user_id).await {
                Ok(()) => {
                    cleaned += 1;
                    tracing::info!(session_id = %session_id, "已清理悬挂会话");
                }
                Err(err) => {
                    tracing::error!(session_id = %session_id, error = %err, "清理悬挂会话失败");
                }
            }
        }

        Ok(cleaned)
    }

    pub async fn members(&self, list_id: &str) -> ApplicationResult<Vec<String>> {
        self.store.presence_members(list_id).await
    }

    /// 固定顺序获取两把锁并在保护下执行操作，任何路径都释放两把锁
    async fn with_pair_locks<T, Fut>(
        &self,
        list_id: &str,
        user_id: &str,
        session_id: &str,
        fut: Fut,
    ) -> ApplicationResult<T>
    where
        Fut: std::future::Future<Output = ApplicationResult<T>>,
    {
        let mut us_lease = self
            .locks
            .acquire(
                &Self::user_sessions_lock_key(list_id, user_id),
                self.config.lock_ttl,
            )
            .await?;

        let mut sl_lease = match self
            .locks
            .acquire(&Self::session_lists_lock_key(session_id), self.config.lock_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                us_lease.release().await;
                return Err(err);
            }
        };

        let result = fut.await;

        sl_lease.release().await;
        us_lease.release().await;
        result
    }

    async fn publish(&self, list_id: &str, user_id: &str, kind: PresenceEventKind) {
        let event = PresenceEvent {
            list_id: list_id.to_string(),
            user_id: user_id.to_string(),
            kind,
            at: self.clock.now(),
        };
        // 事件是尽力而为的提示，失败不影响集合状态
        if let Err(err) = self.events.publish(&event).await {
            tracing::warn!(list_id = %list_id, error = %err, "发布 presence 事件失败");
        }
    }
}

/// 内存实现（测试用）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::{Mutex, RwLock};

    #[derive(Default)]
    pub struct MemoryPresenceStore {
        presence: RwLock<HashMap<String, HashSet<String>>>,
        user_sessions: RwLock<HashMap<(String, String), HashSet<String>>>,
        session_lists: RwLock<HashMap<String, HashSet<String>>>,
        registry: RwLock<HashMap<String, String>>,
        /// 测试注入：接下来 N 次对账尝试返回 Conflict
        conflicts_to_inject: Mutex<u32>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn inject_conflicts(&self, count: u32) {
            *self.conflicts_to_inject.lock().await = count;
        }
    }

    #[async_trait::async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn add_user_session(
            &self,
            list_id: &str,
            user_id: &str,
            session_id: &str,
        ) -> ApplicationResult<(bool, u64)> {
            let mut map = self.user_sessions.write().await;
            let set = map
                .entry((list_id.to_string(), user_id.to_string()))
                .or_default();
            let added = set.insert(session_id.to_string());
            Ok((added, set.len() as u64))
        }

        async fn add_session_list(&self, session_id: &str, list_id: &str) -> ApplicationResult<()> {
            let mut map = self.session_lists.write().await;
            map.entry(session_id.to_string())
                .or_default()
                .insert(list_id.to_string());
            Ok(())
        }

        async fn add_presence(&self, list_id: &str, user_id: &str) -> ApplicationResult<bool> {
            let mut map = self.presence.write().await;
            Ok(map
                .entry(list_id.to_string())
                .or_default()
                .insert(user_id.to_string()))
        }

        async fn remove_user_session(
            &self,
            list_id: &str,
            user_id: &str,
            session_id: &str,
        ) -> ApplicationResult<()> {
            let mut map = self.user_sessions.write().await;
            if let Some(set) = map.get_mut(&(list_id.to_string(), user_id.to_string())) {
                set.remove(session_id);
                if set.is_empty() {
                    map.remove(&(list_id.to_string(), user_id.to_string()));
                }
            }
            Ok(())
        }

        async fn remove_session_list(
            &self,
            session_id: &str,
            list_id: &str,
        ) -> ApplicationResult<()> {
            let mut map = self.session_lists.write().await;
            if let Some(set) = map.get_mut(session_id) {
                set.remove(list_id);
                if set.is_empty() {
                    map.remove(session_id);
                }
            }
            Ok(())
        }

        async fn remove_presence_if_idle(
            &self,
            list_id: &str,
            user_id: &str,
        ) -> ApplicationResult<ReconcileOutcome> {
            {
                let mut conflicts = self.conflicts_to_inject.lock().await;
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Ok(ReconcileOutcome::Conflict);
                }
            }

            let sessions = self.user_sessions.read().await;
            let active = sessions
                .get(&(list_id.to_string(), user_id.to_string()))
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if active {
                return Ok(ReconcileOutcome::UserStillActive);
            }
            drop(sessions);

            let mut presence = self.presence.write().await;
            let removed = presence
                .get_mut(list_id)
                .map(|set| set.remove(user_id))
                .unwrap_or(false);
            Ok(if removed {
                ReconcileOutcome::Removed
            } else {
                ReconcileOutcome::NotMember
            })
        }

        async fn session_lists(&self, session_id: &str) -> ApplicationResult<Vec<String>> {
            let map = self.session_lists.read().await;
            Ok(map
                .get(session_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn presence_members(&self, list_id: &str) -> ApplicationResult<Vec<String>> {
            let map = self.presence.read().await;
            Ok(map
                .get(list_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn register_session(&self, session_id: &str, user_id: &str) -> ApplicationResult<()> {
            let mut registry = self.registry.write().await;
            registry.insert(session_id.to_string(), user_id.to_string());
            Ok(())
        }

        async fn unregister_session(&self, session_id: &str) -> ApplicationResult<()> {
            let mut registry = self.registry.write().await;
            registry.remove(session_id);
            Ok(())
        }

        async fn registered_sessions(&self) -> ApplicationResult<Vec<(String, String)>> {
            let registry = self.registry.read().await;
            Ok(registry
                .iter()
                .map(|(s, u)| (s.clone(), u.clone()))
                .collect())
        }
    }

    /// 记录事件的发布器（测试用）
    #[derive(Default)]
    pub struct RecordingEventPublisher {
        pub events: Mutex<Vec<PresenceEvent>>,
    }

    impl RecordingEventPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<PresenceEvent> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl PresenceEventPublisher for RecordingEventPublisher {
        async fn publish(&self, event: &PresenceEvent) -> ApplicationResult<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }
}
