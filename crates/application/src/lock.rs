//! 分布式锁
//!
//! 短 TTL 的互斥原语，按字符串键加锁。所有共享状态的变更都在单键锁的
//! 保护下进行，锁的作用域始终尽可能小（单个逻辑键，而不是整个子系统）。
//!
//! 获取失败在有限次数内做带抖动的退避重试，耗尽后返回
//! [`ApplicationError::LockTimeout`]。释放是幂等且尽力而为的：失败只记
//! 日志，绝不向调用方抛出，卡死的持有者由 TTL 兜底。

use crate::error::{ApplicationError, ApplicationResult};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// 锁键的命名空间前缀，避免与其他子系统共用存储时冲突
const LOCK_KEY_PREFIX: &str = "locks:";

/// 锁存储后端
///
/// `try_lock` 单次尝试，成功返回 true；`unlock` 只允许持有对应 token 的
/// 调用方删除锁。
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> ApplicationResult<bool>;

    async fn unlock(&self, key: &str, token: &str) -> ApplicationResult<()>;
}

/// 锁获取策略配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 重试基础间隔
    pub retry_delay: Duration,
    /// 每次重试附加的最大随机抖动
    pub max_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_millis(50),
            max_jitter: Duration::from_millis(50),
        }
    }
}

/// 分布式锁管理器
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    /// 获取锁，内部做有限次带抖动的重试，耗尽后返回 `LockTimeout`
    pub async fn acquire(&self, key: &str, ttl: Duration) -> ApplicationResult<LockLease> {
        let full_key = format!("{}{}", LOCK_KEY_PREFIX, key);
        let token = generate_token();

        for attempt in 1..=self.config.max_attempts {
            if self.backend.try_lock(&full_key, &token, ttl).await? {
                return Ok(LockLease {
                    key: full_key,
                    token,
                    backend: Arc::clone(&self.backend),
                    released: false,
                });
            }

            if attempt < self.config.max_attempts {
                sleep(self.retry_delay_at(attempt)).await;
            }
        }

        Err(ApplicationError::LockTimeout(key.to_string()))
    }

    /// 在锁的保护下执行一个操作，保证所有退出路径上都释放锁
    pub async fn with_lock<T, Fut>(&self, key: &str, ttl: Duration, fut: Fut) -> ApplicationResult<T>
    where
        Fut: Future<Output = ApplicationResult<T>>,
    {
        let mut lease = self.acquire(key, ttl).await?;
        let result = fut.await;
        lease.release().await;
        result
    }

    fn retry_delay_at(&self, attempt: u32) -> Duration {
        let exp = std::cmp::min(attempt.saturating_sub(1), 10);
        let base = self.config.retry_delay.saturating_mul(1 << exp);
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

fn generate_token() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

/// 锁租约
///
/// `release` 幂等；未显式释放的租约在 Drop 时记一条警告，由 TTL 过期兜底。
pub struct LockLease {
    key: String,
    token: String,
    backend: Arc<dyn LockBackend>,
    released: bool,
}

impl LockLease {
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(err) = self.backend.unlock(&self.key, &self.token).await {
            tracing::warn!(key = %self.key, error = %err, "释放锁失败，等待 TTL 过期");
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(key = %self.key, "锁租约未显式释放");
        }
    }
}

/// 内存实现的锁后端（测试用）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryLockBackend {
        held: Mutex<HashMap<String, String>>,
    }

    impl MemoryLockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// 当前持有的锁数量
        pub async fn held_count(&self) -> usize {
            self.held.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl LockBackend for MemoryLockBackend {
        async fn try_lock(&self, key: &str, token: &str, _ttl: Duration) -> ApplicationResult<bool> {
            let mut held = self.held.lock().await;
            if held.contains_key(key) {
                return Ok(false);
            }
            held.insert(key.to_string(), token.to_string());
            Ok(true)
        }

        async fn unlock(&self, key: &str, token: &str) -> ApplicationResult<()> {
            let mut held = self.held.lock().await;
            if held.get(key).map(String::as_str) == Some(token) {
                held.remove(key);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryLockBackend;
    use super::*;

    fn fast_config() -> LockConfig {
        LockConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            max_jitter: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = LockManager::new(backend.clone(), fast_config());

        let mut lease = manager
            .acquire("cache:chats:c1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(backend.held_count().await, 1);

        lease.release().await;
        assert_eq!(backend.held_count().await, 0);

        // 释放是幂等的
        lease.release().await;
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = LockManager::new(backend.clone(), fast_config());

        let _held = manager.acquire("k", Duration::from_secs(5)).await.unwrap();
        let second = manager.acquire("k", Duration::from_secs(5)).await;

        assert!(matches!(second, Err(ApplicationError::LockTimeout(_))));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = LockManager::new(backend.clone(), fast_config());

        let result: ApplicationResult<()> = manager
            .with_lock("k", Duration::from_secs(5), async {
                Err(ApplicationError::infrastructure("boom"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(backend.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_token() {
        let backend = Arc::new(MemoryLockBackend::new());
        backend
            .try_lock("locks:k", "token-a", Duration::from_secs(1))
            .await
            .unwrap();

        backend.unlock("locks:k", "token-b").await.unwrap();
        assert_eq!(backend.held_count().await, 1);

        backend.unlock("locks:k", "token-a").await.unwrap();
        assert_eq!(backend.held_count().await, 0);
    }
}
