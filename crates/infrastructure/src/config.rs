//! 基础设施配置
//!
//! 定义 Kafka、Redis 和回写管线的运行参数。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kafka 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka 服务器地址列表
    pub brokers: Vec<String>,
    /// 消息主题（每个消息域一个，例如 messages / reactions）
    pub message_topic: String,
    pub reaction_topic: String,
    /// 消费者组前缀，实际组名为 `<主题>-<角色>`
    pub group_prefix: String,
    /// 消息发送超时时间（毫秒）
    pub send_timeout_ms: u32,
    /// 发送重试次数
    pub retry_count: u32,
    /// 确认模式（all, 1, 0）
    pub acks: String,
    /// 分发消费者的在途投递上限（小，保证低延迟）
    pub distribution_prefetch: usize,
    /// 回写消费者的在途投递上限（大，保证吞吐）
    pub writeback_prefetch: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            message_topic: "conference-messages".to_string(),
            reaction_topic: "conference-reactions".to_string(),
            group_prefix: "backbone".to_string(),
            send_timeout_ms: 5000,
            retry_count: 3,
            acks: "all".to_string(),
            distribution_prefetch: 16,
            writeback_prefetch: 256,
        }
    }
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis 服务器地址
    pub url: String,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u32,
    /// presence 事件频道前缀
    pub presence_channel_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 3000,
            presence_channel_prefix: "presence:".to_string(),
        }
    }
}

/// 回写管线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritebackSettings {
    /// 触发刷新的缓冲总量
    pub flush_threshold: usize,
    /// 定时刷新间隔（毫秒）
    pub flush_interval_ms: u64,
}

impl Default for WritebackSettings {
    fn default() -> Self {
        Self {
            flush_threshold: 50,
            flush_interval_ms: 2000,
        }
    }
}

impl WritebackSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// 哨兵条目重新回源的限速窗口（秒）
    pub rate_limit_secs: u64,
    /// 存储条目的过期时间（秒）
    pub refetch_after_secs: u64,
    /// 离线模式：不访问上游数据 API
    pub offline: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            rate_limit_secs: 30,
            refetch_after_secs: 24 * 3600,
            offline: false,
        }
    }
}

/// 消息架构配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub kafka: KafkaConfig,
    pub redis: RedisConfig,
    pub writeback: WritebackSettings,
    pub cache: CacheSettings,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            redis: RedisConfig::default(),
            writeback: WritebackSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl MessagingConfig {
    /// 从环境变量创建配置
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            // 设置默认值
            .set_default("kafka.brokers", vec!["localhost:9092"])?
            .set_default("kafka.message_topic", "conference-messages")?
            .set_default("kafka.reaction_topic", "conference-reactions")?
            .set_default("kafka.group_prefix", "backbone")?
            .set_default("kafka.send_timeout_ms", 5000)?
            .set_default("kafka.retry_count", 3)?
            .set_default("kafka.acks", "all")?
            .set_default("kafka.distribution_prefetch", 16)?
            .set_default("kafka.writeback_prefetch", 256)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("redis.connection_timeout_ms", 3000)?
            .set_default("redis.presence_channel_prefix", "presence:")?
            .set_default("writeback.flush_threshold", 50)?
            .set_default("writeback.flush_interval_ms", 2000)?
            .set_default("cache.rate_limit_secs", 30)?
            .set_default("cache.refetch_after_secs", 24 * 3600)?
            .set_default("cache.offline", false)?
            // 从环境变量加载
            .add_source(config::Environment::with_prefix("BACKBONE").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), String> {
        if self.kafka.brokers.is_empty() {
            return Err("Kafka brokers cannot be empty".to_string());
        }

        if self.kafka.message_topic.is_empty() || self.kafka.reaction_topic.is_empty() {
            return Err("Kafka topics cannot be empty".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.writeback.flush_threshold == 0 {
            return Err("Writeback flush threshold must be greater than 0".to_string());
        }

        if self.kafka.distribution_prefetch == 0 || self.kafka.writeback_prefetch == 0 {
            return Err("Prefetch must be greater than 0".to_string());
        }

        Ok(())
    }
}
