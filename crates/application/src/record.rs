//! 管线记录抽象
//!
//! 消息和表情回应走同一套分发/回写管线，管线只依赖这里的最小契约：
//! 幂等键、路由用的房间标识、服务端时间戳盖章。

use chrono::{DateTime, Utc};
use domain::{DomainError, Message, Reaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 客户端分配的幂等键
    fn sid(&self) -> &str;

    /// 路由键（目标聊天室）
    fn chat_id(&self) -> &str;

    /// 记录作者
    fn author_id(&self) -> &str;

    fn validate(&self) -> Result<(), DomainError>;

    /// INSERT 时盖章：清除客户端可能传入的服务端字段并写入创建时间
    fn stamp_created(&mut self, at: DateTime<Utc>);

    fn stamp_updated(&mut self, at: DateTime<Utc>);
}

impl Record for Message {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn author_id(&self) -> &str {
        &self.user_id
    }

    fn validate(&self) -> Result<(), DomainError> {
        Message::validate(self)
    }

    fn stamp_created(&mut self, at: DateTime<Utc>) {
        self.id = None;
        self.created_at = Some(at);
        self.updated_at = None;
    }

    fn stamp_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

impl Record for Reaction {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn author_id(&self) -> &str {
        &self.user_id
    }

    fn validate(&self) -> Result<(), DomainError> {
        Reaction::validate(self)
    }

    fn stamp_created(&mut self, at: DateTime<Utc>) {
        self.id = None;
        self.created_at = Some(at);
        self.updated_at = None;
    }

    fn stamp_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}
