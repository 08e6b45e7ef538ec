//! 实时分发
//!
//! 分发消费者的唯一职责是把动作尽快推到聊天室的在线连接上。投递先确认
//! 再广播：广播失败意味着连接层有问题，重投同样无济于事，且重投会把
//! 实时流变成延迟流——对实时消息而言，迟到比丢失更糟。

use crate::broker::Delivery;
use crate::record::Record;
use crate::transport::LiveTransport;
use domain::Action;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct DistributionWorker<T> {
    transport: Arc<dyn LiveTransport>,
    domain_name: &'static str,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Record> DistributionWorker<T> {
    pub fn new(transport: Arc<dyn LiveTransport>, domain_name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            transport,
            domain_name,
            _marker: std::marker::PhantomData,
        })
    }

    /// 消费循环，接收端关闭时退出
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = receiver.recv().await {
            self.dispatch(delivery).await;
        }
        tracing::info!(domain = self.domain_name, "分发队列已关闭，工作器退出");
    }

    /// 处理一条投递：立即确认，然后广播
    pub async fn dispatch(&self, delivery: Delivery) {
        if let Err(err) = delivery.handle.ack().await {
            tracing::warn!(domain = self.domain_name, error = %err, "分发投递确认失败");
        }

        let action: Action<T> = match serde_json::from_slice(&delivery.payload) {
            Ok(action) => action,
            Err(err) => {
                tracing::error!(domain = self.domain_name, error = %err, "分发负载解析失败，丢弃");
                return;
            }
        };

        let room_id = action.data.chat_id().to_string();
        let payload = match serde_json::to_value(&action) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(domain = self.domain_name, error = %err, "分发负载序列化失败");
                return;
            }
        };

        if let Err(err) = self.transport.broadcast_to_room(&room_id, &payload).await {
            tracing::warn!(
                domain = self.domain_name,
                room_id,
                op = %action.op,
                error = %err,
                "房间广播失败"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerChannel, ConsumerRole};
    use crate::transport::memory::RecordingTransport;
    use domain::Message;

    fn message(sid: &str) -> Message {
        Message {
            id: None,
            sid: sid.to_string(),
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_name: None,
            text: "hi".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_acks_then_broadcasts() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe(ConsumerRole::Distribution).await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let worker = DistributionWorker::<Message>::new(transport.clone(), "messages");

        let action = Action::insert(message("m1"));
        broker
            .publish("c1", &serde_json::to_vec(&action).unwrap())
            .await
            .unwrap();

        worker.dispatch(rx.recv().await.unwrap()).await;

        let broadcasts = transport.broadcasts().await;
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, "c1");
        assert_eq!(broadcasts[0].1["op"], "INSERT");
        assert_eq!(broadcasts[0].1["data"]["sId"], "m1");

        let (pending, acked, _) = broker.handle_counts().await;
        assert_eq!((pending, acked), (0, 1));
    }

    #[tokio::test]
    async fn test_malformed_payload_acked_and_dropped() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe(ConsumerRole::Distribution).await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let worker = DistributionWorker::<Message>::new(transport.clone(), "messages");

        broker.publish("c1", b"not json").await.unwrap();
        worker.dispatch(rx.recv().await.unwrap()).await;

        assert!(transport.broadcasts().await.is_empty());
        let (pending, acked, _) = broker.handle_counts().await;
        assert_eq!((pending, acked), (0, 1));
    }
}
