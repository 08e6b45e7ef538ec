//! 表情回应实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 对某条消息的表情回应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    /// 服务端数据库标识，INSERT 入口会剥离客户端传入的值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// 客户端分配的全局唯一标识（幂等键）
    #[serde(rename = "sId")]
    pub sid: String,
    pub chat_id: String,
    /// 目标消息的 sId
    #[serde(rename = "messageSId")]
    pub message_sid: String,
    pub user_id: String,
    /// 回应内容（emoji 短码）
    pub kind: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Reaction {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.sid.is_empty() {
            return Err(DomainError::Validation("sId 不能为空".to_string()));
        }
        if self.chat_id.is_empty() {
            return Err(DomainError::Validation("chat_id 不能为空".to_string()));
        }
        if self.message_sid.is_empty() {
            return Err(DomainError::Validation("messageSId 不能为空".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(DomainError::Validation("user_id 不能为空".to_string()));
        }
        if self.kind.is_empty() {
            return Err(DomainError::Validation("kind 不能为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaction_validation() {
        let reaction = Reaction {
            id: None,
            sid: "r1".to_string(),
            chat_id: "c1".to_string(),
            message_sid: "m1".to_string(),
            user_id: "u1".to_string(),
            kind: "+1".to_string(),
            created_at: None,
            updated_at: None,
        };
        assert!(reaction.validate().is_ok());

        let mut missing_target = reaction.clone();
        missing_target.message_sid = String::new();
        assert!(missing_target.validate().is_err());
    }
}
