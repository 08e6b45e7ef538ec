//! 通用限速读穿/写穿缓存
//!
//! 约定与常规 TTL 缓存不同：一旦存入非哨兵值，后续读取永远直接返回，
//! 不做基于 TTL 的淘汰；只有哨兵（"上游确认不存在"）条目才会在限速
//! 窗口之外重新回源。每个键的回源在分布式锁的保护下串行化，避免多进程
//! 同时未命中时冲击上游。

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::lock::LockManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 缓存条目
///
/// `value: None` 是显式的哨兵，表示"已回源但上游没有该值"，与"尚未
/// 回源"（存储中没有条目）是两种不同状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// 回源时间（毫秒时间戳）
    pub fetched_at: i64,
    pub value: Option<T>,
}

/// 缓存条目存储
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> ApplicationResult<Option<String>>;

    /// 仅在键不存在时写入，返回是否写入成功
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> ApplicationResult<bool>;

    /// 无条件覆盖写入
    async fn set(&self, key: &str, value: &str, expiry: Duration) -> ApplicationResult<()>;
}

/// 回源函数
#[async_trait::async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self, key: &str) -> ApplicationResult<Option<T>>;
}

/// 缓存行为配置
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// 键的命名空间，条目存储在 `<namespace>:<key>` 下
    pub namespace: String,
    /// 哨兵条目的重新回源限速窗口
    pub rate_limit_period: Duration,
    /// 存储条目的过期时间
    pub refetch_after: Duration,
    /// 锁 TTL
    pub lock_ttl: Duration,
    /// 离线模式：不访问上游，用调用方提供的回退值代替回源结果
    pub offline: bool,
}

impl CacheOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            rate_limit_period: Duration::from_secs(30),
            refetch_after: Duration::from_secs(24 * 3600),
            lock_ttl: Duration::from_secs(5),
            offline: false,
        }
    }
}

/// 限速读穿/写穿缓存
pub struct Cache<T> {
    store: Arc<dyn CacheStore>,
    locks: LockManager,
    fetcher: Arc<dyn Fetcher<T>>,
    clock: Arc<dyn Clock>,
    options: CacheOptions,
}

impl<T> Cache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: LockManager,
        fetcher: Arc<dyn Fetcher<T>>,
        clock: Arc<dyn Clock>,
        options: CacheOptions,
    ) -> Self {
        Self {
            store,
            locks,
            fetcher,
            clock,
            options,
        }
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.options.namespace, key)
    }

    /// 读取缓存值
    ///
    /// 命中非哨兵条目（且未强制刷新）直接返回；哨兵条目或强制刷新在
    /// 限速窗口内返回存储值，窗口外回源并以 set-if-absent 方式写回。
    /// 锁在所有路径上都会释放，包括回源出错时。
    pub async fn get(
        &self,
        key: &str,
        offline_fallback: Option<T>,
        force_refetch: bool,
    ) -> ApplicationResult<Option<T>> {
        let entry_key = self.entry_key(key);

        let mut lease = self.locks.acquire(&entry_key, self.options.lock_ttl).await?;
        let result = self
            .get_locked(key, &entry_key, offline_fallback, force_refetch)
            .await;
        lease.release().await;
        result
    }

    async fn get_locked(
        &self,
        key: &str,
        entry_key: &str,
        offline_fallback: Option<T>,
        force_refetch: bool,
    ) -> ApplicationResult<Option<T>> {
        if let Some(raw) = self.store.get(entry_key).await? {
            let entry: CacheEntry<T> = serde_json::from_str(&raw).map_err(|e| {
                ApplicationError::infrastructure_with_source("缓存条目反序列化失败", e)
            })?;

            let is_hit = entry.value.is_some();
            if is_hit && !force_refetch {
                return Ok(entry.value);
            }

            // 哨兵或强制刷新：限速窗口内不回源
            let age_ms = self.clock.now_millis() - entry.fetched_at;
            if age_ms < self.options.rate_limit_period.as_millis() as i64 {
                return Ok(entry.value);
            }
        }

        let fetched = if self.options.offline {
            offline_fallback
        } else {
            self.fetcher.fetch(key).await?
        };

        let entry = CacheEntry {
            fetched_at: self.clock.now_millis(),
            value: fetched.clone(),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| ApplicationError::infrastructure_with_source("缓存条目序列化失败", e))?;
        self.store
            .set_if_absent(entry_key, &raw, self.options.refetch_after)
            .await?;

        Ok(fetched)
    }

    /// 读-改-写更新缓存值
    ///
    /// 读取现有值（哨兵或缺失时用 `fallback`），应用 `mutate` 后无条件
    /// 覆盖写回。用于对缓存集合做增减（例如切换置顶）。
    pub async fn update<F>(&self, key: &str, fallback: T, mutate: F) -> ApplicationResult<()>
    where
        F: FnOnce(T) -> T + Send,
    {
        let entry_key = self.entry_key(key);

        let mut lease = self.locks.acquire(&entry_key, self.options.lock_ttl).await?;
        let result = self.update_locked(&entry_key, fallback, mutate).await;
        lease.release().await;
        result
    }

    async fn update_locked<F>(&self, entry_key: &str, fallback: T, mutate: F) -> ApplicationResult<()>
    where
        F: FnOnce(T) -> T + Send,
    {
        let existing = match self.store.get(entry_key).await? {
            Some(raw) => serde_json::from_str::<CacheEntry<T>>(&raw)
                .map_err(|e| {
                    ApplicationError::infrastructure_with_source("缓存条目反序列化失败", e)
                })?
                .value,
            None => None,
        };

        let next = mutate(existing.unwrap_or(fallback));
        let entry = CacheEntry {
            fetched_at: self.clock.now_millis(),
            value: Some(next),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| ApplicationError::infrastructure_with_source("缓存条目序列化失败", e))?;
        self.store.set(entry_key, &raw, self.options.refetch_after).await
    }
}

/// 内存实现的缓存存储（测试用）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryCacheStore {
        entries: Mutex<HashMap<String, (String, Instant)>>,
    }

    impl MemoryCacheStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl CacheStore for MemoryCacheStore {
        async fn get(&self, key: &str) -> ApplicationResult<Option<String>> {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
                Some(_) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            expiry: Duration,
        ) -> ApplicationResult<bool> {
            let mut entries = self.entries.lock().await;
            let live = entries
                .get(key)
                .map(|(_, expires)| *expires > Instant::now())
                .unwrap_or(false);
            if live {
                return Ok(false);
            }
            entries.insert(key.to_string(), (value.to_string(), Instant::now() + expiry));
            Ok(true)
        }

        async fn set(&self, key: &str, value: &str, expiry: Duration) -> ApplicationResult<()> {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_string(), (value.to_string(), Instant::now() + expiry));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCacheStore;
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::lock::memory::MemoryLockBackend;
    use crate::lock::LockConfig;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: AtomicU32,
        value: Option<String>,
    }

    impl CountingFetcher {
        fn new(value: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                value: value.map(str::to_string),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher<String> for CountingFetcher {
        async fn fetch(&self, _key: &str) -> ApplicationResult<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    fn build_cache(
        fetcher: Arc<CountingFetcher>,
        clock: Arc<ManualClock>,
        options: CacheOptions,
    ) -> Cache<String> {
        let store = Arc::new(MemoryCacheStore::new());
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()), LockConfig::default());
        Cache::new(store, locks, fetcher, clock, options)
    }

    #[tokio::test]
    async fn test_hit_never_refetches() {
        let fetcher = CountingFetcher::new(Some("v"));
        let clock = ManualClock::new(Utc::now());
        let cache = build_cache(fetcher.clone(), clock.clone(), CacheOptions::new("info"));

        assert_eq!(cache.get("k", None, false).await.unwrap().as_deref(), Some("v"));
        assert_eq!(fetcher.calls(), 1);

        // 远超限速窗口之后命中仍然不回源
        clock.advance_millis(3_600_000);
        assert_eq!(cache.get("k", None, false).await.unwrap().as_deref(), Some("v"));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_miss_is_rate_limited() {
        let fetcher = CountingFetcher::new(None);
        let clock = ManualClock::new(Utc::now());
        let mut options = CacheOptions::new("info");
        options.rate_limit_period = Duration::from_millis(500);
        let cache = build_cache(fetcher.clone(), clock.clone(), options);

        assert_eq!(cache.get("k", None, false).await.unwrap(), None);
        assert_eq!(cache.get("k", None, false).await.unwrap(), None);
        // 限速窗口内第二次读取不触发上游回源
        assert_eq!(fetcher.calls(), 1);

        clock.advance_millis(600);
        assert_eq!(cache.get("k", None, false).await.unwrap(), None);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refetch_respects_rate_limit() {
        let fetcher = CountingFetcher::new(Some("v"));
        let clock = ManualClock::new(Utc::now());
        let mut options = CacheOptions::new("info");
        options.rate_limit_period = Duration::from_millis(500);
        let cache = build_cache(fetcher.clone(), clock.clone(), options);

        assert_eq!(cache.get("k", None, false).await.unwrap().as_deref(), Some("v"));
        // 强制刷新但仍在限速窗口内：返回存储值，不回源
        assert_eq!(cache.get("k", None, true).await.unwrap().as_deref(), Some("v"));
        assert_eq!(fetcher.calls(), 1);

        clock.advance_millis(600);
        assert_eq!(cache.get("k", None, true).await.unwrap().as_deref(), Some("v"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_mode_uses_fallback() {
        let fetcher = CountingFetcher::new(Some("live"));
        let clock = ManualClock::new(Utc::now());
        let mut options = CacheOptions::new("info");
        options.offline = true;
        let cache = build_cache(fetcher.clone(), clock, options);

        let value = cache.get("k", Some("fallback".to_string()), false).await.unwrap();
        assert_eq!(value.as_deref(), Some("fallback"));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_update_overwrites_unconditionally() {
        let fetcher = CountingFetcher::new(None);
        let clock = ManualClock::new(Utc::now());
        let cache = build_cache(fetcher.clone(), clock, CacheOptions::new("info"));

        // 不存在的键：用 fallback 起步
        cache
            .update("k", "base".to_string(), |v| format!("{v}+1"))
            .await
            .unwrap();
        assert_eq!(cache.get("k", None, false).await.unwrap().as_deref(), Some("base+1"));

        cache
            .update("k", "base".to_string(), |v| format!("{v}+2"))
            .await
            .unwrap();
        assert_eq!(
            cache.get("k", None, false).await.unwrap().as_deref(),
            Some("base+1+2")
        );
        // update 路径从不回源
        assert_eq!(fetcher.calls(), 0);
    }
}
