//! Kafka 消息代理适配

pub mod channel;
pub mod error;

// 重新导出
pub use channel::KafkaBrokerChannel;
pub use error::{KafkaError, KafkaResult};
