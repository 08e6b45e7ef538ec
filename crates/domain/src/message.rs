//! 聊天消息实体
//!
//! `sid` 由客户端生成并作为持久化幂等键，服务端只负责时间戳。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 聊天消息
///
/// `created_at`/`updated_at` 在 INSERT 时由服务端盖章，不信任客户端传入的值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 服务端数据库标识，INSERT 入口会剥离客户端传入的值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// 客户端分配的全局唯一标识（幂等键）
    #[serde(rename = "sId")]
    pub sid: String,
    /// 目标聊天室
    pub chat_id: String,
    /// 发送者
    pub user_id: String,
    /// 发送者显示名（冗余存储，避免广播时再查询）
    pub user_name: Option<String>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// 校验消息形状是否可发布
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.sid.is_empty() {
            return Err(DomainError::Validation("sId 不能为空".to_string()));
        }
        if self.chat_id.is_empty() {
            return Err(DomainError::Validation("chat_id 不能为空".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(DomainError::Validation("user_id 不能为空".to_string()));
        }
        if self.text.trim().is_empty() {
            return Err(DomainError::Validation("消息内容为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            id: None,
            sid: "m1".to_string(),
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_name: Some("Alice".to_string()),
            text: "hi".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_sid_wire_name() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"sId\":\"m1\""));
    }

    #[test]
    fn test_validation() {
        assert!(sample().validate().is_ok());

        let mut empty_text = sample();
        empty_text.text = "   ".to_string();
        assert!(empty_text.validate().is_err());

        let mut no_sid = sample();
        no_sid.sid = String::new();
        assert!(no_sid.validate().is_err());
    }
}
