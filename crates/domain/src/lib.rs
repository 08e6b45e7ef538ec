//! 会议实时系统核心领域模型
//!
//! 包含消息、表情回应、会话存在状态等核心类型，以及变更事件的信封结构。

pub mod action;
pub mod chat;
pub mod errors;
pub mod message;
pub mod reaction;
pub mod webhook;

// 重新导出常用类型
pub use action::{Action, ActionOp};
pub use chat::{ChatInfo, ConferenceGrant, GrantRole, UserGrants};
pub use errors::DomainError;
pub use message::Message;
pub use reaction::Reaction;
pub use webhook::{ChangeSet, TriggerInfo, WebhookEnvelope, WebhookEvent, WebhookOp};
