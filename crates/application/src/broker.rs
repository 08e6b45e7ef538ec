//! 消息代理抽象
//!
//! 每个消息域一个持久化主题，路由键为聊天室标识。同一次发布被两个独立
//! 的消费角色各自收到：低延迟的分发角色和高吞吐的回写角色，互不依赖
//! 对方的存活状态——持久化积压不影响实时投递，反之亦然。
//!
//! 投递携带确认句柄：ack 将消息从队列移除，nack 触发代理侧重投。回写
//! 消费者在数据库结果明确之前不确认，配合有界的预取量构成背压。

use crate::error::ApplicationResult;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 消费角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerRole {
    /// 实时分发：小预取量，低延迟
    Distribution,
    /// 持久化回写：大预取量，高吞吐
    Writeback,
}

impl ConsumerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerRole::Distribution => "distribution",
            ConsumerRole::Writeback => "writeback",
        }
    }
}

/// 投递确认句柄
///
/// 每条投递最终必须走到 ack 或 nack 之一，不允许悬而不决。
#[async_trait::async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// 确认：消息从队列移除
    async fn ack(&self) -> ApplicationResult<()>;

    /// 否认：消息由代理重投
    async fn nack(&self) -> ApplicationResult<()>;
}

/// 一次投递
pub struct Delivery {
    pub payload: Vec<u8>,
    pub handle: Arc<dyn DeliveryHandle>,
}

/// 消息代理通道
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 发布一条持久化消息，等待代理确认（带硬超时）
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> ApplicationResult<()>;

    /// 以指定角色订阅本通道，返回投递接收端
    async fn subscribe(&self, role: ConsumerRole) -> ApplicationResult<mpsc::Receiver<Delivery>>;
}

/// 内存实现的消息代理（测试用）
///
/// 记录每条投递的确认状态，便于断言 ack/nack 行为；nack 的消息会重新
/// 投递给同角色的订阅者。
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HandleState {
        Pending,
        Acked,
        Nacked,
    }

    #[derive(Default)]
    struct BrokerState {
        subscribers: HashMap<ConsumerRole, Vec<mpsc::Sender<Delivery>>>,
        handles: HashMap<u64, HandleState>,
    }

    pub struct MemoryBroker {
        state: Arc<Mutex<BrokerState>>,
        next_id: Arc<AtomicU64>,
        redeliver_on_nack: bool,
    }

    impl Default for MemoryBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryBroker {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(BrokerState::default())),
                next_id: Arc::new(AtomicU64::new(0)),
                redeliver_on_nack: false,
            }
        }

        /// nack 时向同角色订阅者重投（模拟代理重投语义）
        pub fn with_redelivery() -> Self {
            Self {
                redeliver_on_nack: true,
                ..Self::new()
            }
        }

        /// 各确认状态的投递数量 (pending, acked, nacked)
        pub async fn handle_counts(&self) -> (usize, usize, usize) {
            let state = self.state.lock().await;
            let mut counts = (0, 0, 0);
            for s in state.handles.values() {
                match s {
                    HandleState::Pending => counts.0 += 1,
                    HandleState::Acked => counts.1 += 1,
                    HandleState::Nacked => counts.2 += 1,
                }
            }
            counts
        }
    }

    struct MemoryDeliveryHandle {
        id: u64,
        role: ConsumerRole,
        payload: Vec<u8>,
        state: Arc<Mutex<BrokerState>>,
        next_id: Arc<AtomicU64>,
        redeliver: bool,
    }

    #[async_trait::async_trait]
    impl DeliveryHandle for MemoryDeliveryHandle {
        async fn ack(&self) -> ApplicationResult<()> {
            let mut state = self.state.lock().await;
            state.handles.insert(self.id, HandleState::Acked);
            Ok(())
        }

        async fn nack(&self) -> ApplicationResult<()> {
            let senders = {
                let mut state = self.state.lock().await;
                state.handles.insert(self.id, HandleState::Nacked);
                if self.redeliver {
                    state.subscribers.get(&self.role).cloned().unwrap_or_default()
                } else {
                    Vec::new()
                }
            };

            for sender in senders {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.state.lock().await;
                    state.handles.insert(id, HandleState::Pending);
                }
                let delivery = Delivery {
                    payload: self.payload.clone(),
                    handle: Arc::new(MemoryDeliveryHandle {
                        id,
                        role: self.role,
                        payload: self.payload.clone(),
                        state: Arc::clone(&self.state),
                        next_id: Arc::clone(&self.next_id),
                        redeliver: self.redeliver,
                    }),
                };
                let _ = sender.send(delivery).await;
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl BrokerChannel for MemoryBroker {
        async fn publish(&self, _routing_key: &str, payload: &[u8]) -> ApplicationResult<()> {
            let senders: Vec<(ConsumerRole, mpsc::Sender<Delivery>)> = {
                let state = self.state.lock().await;
                state
                    .subscribers
                    .iter()
                    .flat_map(|(role, senders)| {
                        senders.iter().map(|s| (*role, s.clone())).collect::<Vec<_>>()
                    })
                    .collect()
            };

            for (role, sender) in senders {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.state.lock().await;
                    state.handles.insert(id, HandleState::Pending);
                }
                let delivery = Delivery {
                    payload: payload.to_vec(),
                    handle: Arc::new(MemoryDeliveryHandle {
                        id,
                        role,
                        payload: payload.to_vec(),
                        state: Arc::clone(&self.state),
                        next_id: Arc::clone(&self.next_id),
                        redeliver: self.redeliver_on_nack,
                    }),
                };
                let _ = sender.send(delivery).await;
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            role: ConsumerRole,
        ) -> ApplicationResult<mpsc::Receiver<Delivery>> {
            let (sender, receiver) = mpsc::channel(256);
            let mut state = self.state.lock().await;
            state.subscribers.entry(role).or_default().push(sender);
            Ok(receiver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBroker;
    use super::*;

    #[tokio::test]
    async fn test_single_publish_reaches_both_roles() {
        let broker = MemoryBroker::new();
        let mut distribution = broker.subscribe(ConsumerRole::Distribution).await.unwrap();
        let mut writeback = broker.subscribe(ConsumerRole::Writeback).await.unwrap();

        broker.publish("c1", b"payload").await.unwrap();

        let d = distribution.recv().await.unwrap();
        let w = writeback.recv().await.unwrap();
        assert_eq!(d.payload, b"payload");
        assert_eq!(w.payload, b"payload");
    }

    #[tokio::test]
    async fn test_ack_and_nack_tracked() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe(ConsumerRole::Writeback).await.unwrap();

        broker.publish("c1", b"a").await.unwrap();
        broker.publish("c1", b"b").await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        first.handle.ack().await.unwrap();
        second.handle.nack().await.unwrap();

        let (pending, acked, nacked) = broker.handle_counts().await;
        assert_eq!((pending, acked, nacked), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let broker = MemoryBroker::with_redelivery();
        let mut rx = broker.subscribe(ConsumerRole::Writeback).await.unwrap();

        broker.publish("c1", b"a").await.unwrap();
        let first = rx.recv().await.unwrap();
        first.handle.nack().await.unwrap();

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.payload, b"a");
    }
}
