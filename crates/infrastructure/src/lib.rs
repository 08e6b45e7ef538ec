//! 基础设施层
//!
//! 应用层端口的具体适配：Redis（锁、缓存、presence、pub/sub）、
//! Kafka（消息代理通道）、Postgres（动作存储）以及它们的配置。

pub mod config;
pub mod db;
pub mod kafka;
pub mod redis;

pub use config::{CacheSettings, KafkaConfig, MessagingConfig, RedisConfig, WritebackSettings};
pub use db::{health_check, PgChatFetcher, PgGrantsFetcher, PgMessageStore, PgReactionStore};
pub use kafka::KafkaBrokerChannel;
pub use redis::{
    RedisCacheStore, RedisLiveTransport, RedisLockBackend, RedisPresencePublisher,
    RedisPresenceStore,
};
