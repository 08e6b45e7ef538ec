//! Kafka 消息代理通道
//!
//! 每个消息域一个主题，房间标识作为分区键保证同房间内的顺序。两个消费
//! 角色对应两个独立的消费者组（`<前缀>-<主题>-distribution` /
//! `-writeback`），一次发布同时到达两组。
//!
//! 确认语义建立在手动位点存储上（`enable.auto.offset.store=false`）：
//! ack 通过低水位追踪器推进可提交位点——只有某位点之前的投递全部确认，
//! 该位点才会被存储；nack 把消费位置 seek 回被否认的位点，由下一轮
//! recv 重新投递。

use crate::config::KafkaConfig;
use crate::kafka::error::KafkaError;
use application::{ApplicationError, ApplicationResult, BrokerChannel, ConsumerRole, Delivery, DeliveryHandle};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use rdkafka::Offset;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Kafka 实现的消息代理通道
pub struct KafkaBrokerChannel {
    producer: FutureProducer,
    topic: String,
    config: KafkaConfig,
}

impl KafkaBrokerChannel {
    /// 创建指向单个主题的通道
    pub fn new(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .set("acks", &config.acks)
            .set("retries", config.retry_count.to_string())
            .set("compression.type", "snappy")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5");

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| KafkaError::ConfigError {
                    message: format!("创建 Kafka 生产者失败: {}", e),
                })?;

        let topic = topic.into();
        tracing::info!(topic = %topic, brokers = %config.brokers.join(","), "Kafka 通道创建成功");

        Ok(Self {
            producer,
            topic,
            config: config.clone(),
        })
    }

    fn group_id(&self, role: ConsumerRole) -> String {
        format!("{}-{}-{}", self.config.group_prefix, self.topic, role.as_str())
    }

    fn create_consumer(&self, role: ConsumerRole) -> Result<StreamConsumer, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", self.group_id(role))
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            // 位点只在显式 ack 后存储
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");

        match role {
            ConsumerRole::Distribution => {
                client_config.set("fetch.wait.max.ms", "10");
            }
            ConsumerRole::Writeback => {
                client_config
                    .set("fetch.wait.max.ms", "100")
                    .set("fetch.min.bytes", "1024");
            }
        }

        client_config.create().map_err(|e| KafkaError::ConfigError {
            message: format!("创建 Kafka 消费者失败: {}", e),
        })
    }

    fn prefetch(&self, role: ConsumerRole) -> usize {
        match role {
            ConsumerRole::Distribution => self.config.distribution_prefetch,
            ConsumerRole::Writeback => self.config.writeback_prefetch,
        }
    }

    /// 带重试的发送，指数退避
    async fn send_with_retry(
        &self,
        payload: &[u8],
        partition_key: &str,
        retry_count: u32,
    ) -> Result<(), KafkaError> {
        let record = FutureRecord::to(&self.topic)
            .payload(payload)
            .key(partition_key);

        let timeout = Duration::from_millis(self.config.send_timeout_ms as u64);

        match self.producer.send(record, Timeout::After(timeout)).await {
            Ok(_) => {
                if retry_count > 0 {
                    tracing::info!(topic = %self.topic, retry_count, "重试后发送成功");
                }
                Ok(())
            }
            Err((kafka_err, _)) => {
                if retry_count < self.config.retry_count {
                    tracing::warn!(
                        topic = %self.topic,
                        attempt = retry_count + 1,
                        error = %kafka_err,
                        "发送失败，准备重试"
                    );

                    let delay = Duration::from_millis(100 * (2_u64.pow(retry_count)));
                    sleep(delay).await;

                    return Box::pin(self.send_with_retry(payload, partition_key, retry_count + 1))
                        .await;
                }

                tracing::error!(topic = %self.topic, error = %kafka_err, "发送失败，已达最大重试次数");
                Err(KafkaError::ProducerError {
                    message: format!("发送失败: {}", kafka_err),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for KafkaBrokerChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> ApplicationResult<()> {
        self.send_with_retry(payload, routing_key, 0)
            .await
            .map_err(ApplicationError::from)
    }

    async fn subscribe(&self, role: ConsumerRole) -> ApplicationResult<mpsc::Receiver<Delivery>> {
        let consumer = Arc::new(self.create_consumer(role).map_err(ApplicationError::from)?);
        consumer
            .subscribe(&[&self.topic])
            .map_err(|e| ApplicationError::infrastructure_with_source("订阅主题失败", e))?;

        tracing::info!(topic = %self.topic, group = %self.group_id(role), "已订阅主题");

        // 通道容量即预取上限：接收端不消费时 recv 循环阻塞在 send 上
        let (sender, receiver) = mpsc::channel(self.prefetch(role));
        let tracker = Arc::new(Mutex::new(OffsetTracker::default()));
        let topic = self.topic.clone();

        tokio::spawn(consume_loop(consumer, tracker, sender, topic, role));

        Ok(receiver)
    }
}

/// 消费循环：接收端关闭时退出，接收失败做有限次退避重试
async fn consume_loop(
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    sender: mpsc::Sender<Delivery>,
    topic: String,
    role: ConsumerRole,
) {
    let mut retry_count: u32 = 0;
    const MAX_RETRIES: u32 = 5;

    loop {
        match consumer.recv().await {
            Ok(message) => {
                retry_count = 0;

                let partition = message.partition();
                let offset = message.offset();
                let payload = message.payload().unwrap_or_default().to_vec();

                if let Ok(mut tracker) = tracker.lock() {
                    tracker.record_delivered(partition, offset);
                }

                let delivery = Delivery {
                    payload,
                    handle: Arc::new(KafkaDeliveryHandle {
                        consumer: Arc::clone(&consumer),
                        tracker: Arc::clone(&tracker),
                        topic: topic.clone(),
                        partition,
                        offset,
                    }),
                };

                if sender.send(delivery).await.is_err() {
                    tracing::info!(topic = %topic, role = role.as_str(), "接收端已关闭，消费循环退出");
                    return;
                }
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "接收消息失败");
                retry_count += 1;

                if retry_count >= MAX_RETRIES {
                    tracing::error!(topic = %topic, "达到最大重试次数，停止消费");
                    return;
                }

                let delay = Duration::from_millis(1000 * (2_u64.pow(retry_count - 1)));
                sleep(delay).await;
            }
        }
    }
}

/// Kafka 投递确认句柄
struct KafkaDeliveryHandle {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait::async_trait]
impl DeliveryHandle for KafkaDeliveryHandle {
    async fn ack(&self) -> ApplicationResult<()> {
        let store = {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| ApplicationError::infrastructure("位点追踪器锁中毒"))?;
            tracker.ack(self.partition, self.offset)
        };

        if let Some(offset) = store {
            self.consumer
                .store_offset(&self.topic, self.partition, offset)
                .map_err(|e| ApplicationError::infrastructure_with_source("存储位点失败", e))?;
        }
        Ok(())
    }

    async fn nack(&self) -> ApplicationResult<()> {
        let seek_to = {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| ApplicationError::infrastructure("位点追踪器锁中毒"))?;
            tracker.nack(self.partition, self.offset)
        };

        self.consumer
            .seek(
                &self.topic,
                self.partition,
                Offset::Offset(seek_to),
                Timeout::After(Duration::from_secs(5)),
            )
            .map_err(|e| ApplicationError::infrastructure_with_source("seek 失败", e))?;

        tracing::debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = seek_to,
            "已 seek 回位点等待重投"
        );
        Ok(())
    }
}

/// 按分区的低水位位点追踪
///
/// Kafka 的位点是游标不是逐条回执，而上层按条 ack。追踪器记录每个分区
/// 在途（已投递未确认）的位点集合，只把"之前全部确认"的最高位点交给
/// 位点存储，乱序确认不会越过未确认的投递。
#[derive(Default)]
struct OffsetTracker {
    partitions: HashMap<i32, PartitionProgress>,
}

struct PartitionProgress {
    max_delivered: i64,
    pending: BTreeSet<i64>,
}

impl OffsetTracker {
    fn record_delivered(&mut self, partition: i32, offset: i64) {
        let progress = self.partitions.entry(partition).or_insert(PartitionProgress {
            max_delivered: -1,
            pending: BTreeSet::new(),
        });
        progress.pending.insert(offset);
        progress.max_delivered = progress.max_delivered.max(offset);
    }

    /// 确认一个位点，返回此刻可存储的位点（该位点之前全部已确认）
    fn ack(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let progress = self.partitions.get_mut(&partition)?;
        progress.pending.remove(&offset);

        let committable = match progress.pending.first() {
            Some(min_pending) => min_pending - 1,
            None => progress.max_delivered,
        };
        (committable >= 0).then_some(committable)
    }

    /// 否认一个位点，返回应 seek 回的位点；该位点之后的在途投递会被
    /// 重新投递，从追踪中移除
    fn nack(&mut self, partition: i32, offset: i64) -> i64 {
        if let Some(progress) = self.partitions.get_mut(&partition) {
            progress.pending.retain(|&o| o < offset);
            progress.max_delivered = offset - 1;
        }
        offset
    }
}
