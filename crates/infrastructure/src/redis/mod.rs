//! Redis 适配器
//!
//! 分布式锁、缓存存储、presence 集合存储和 presence 事件发布，全部走
//! 多路复用的异步连接。

pub mod cache_store;
pub mod error;
pub mod lock;
pub mod presence_store;
pub mod publisher;
pub mod transport;

// 重新导出
pub use cache_store::RedisCacheStore;
pub use error::{RedisError, RedisResult};
pub use lock::RedisLockBackend;
pub use presence_store::RedisPresenceStore;
pub use publisher::RedisPresencePublisher;
pub use transport::RedisLiveTransport;
