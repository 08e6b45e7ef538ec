//! 数据层变更触发器的入站信封
//!
//! 外部数据层的 change-trigger 以该格式回调本服务，形状校验必须严格，
//! 有效记录取 `new ?? old`。

use serde::{Deserialize, Serialize};

/// 触发器操作类型（比 [`crate::ActionOp`] 多出 MANUAL，表示人工补发）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookOp {
    Insert,
    Update,
    Delete,
    Manual,
}

/// 变更前后的记录对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

/// 变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent<T> {
    pub op: WebhookOp,
    pub data: ChangeSet<T>,
}

/// 触发器标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub name: String,
}

/// 入站信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope<T> {
    pub event: WebhookEvent<T>,
    pub trigger: TriggerInfo,
    pub table: serde_json::Value,
}

impl<T> WebhookEnvelope<T> {
    /// 有效记录：优先取变更后的新值，DELETE 场景回退到旧值
    pub fn effective_record(&self) -> Option<&T> {
        self.event.data.new.as_ref().or(self.event.data.old.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_record_prefers_new() {
        let envelope = WebhookEnvelope {
            event: WebhookEvent {
                op: WebhookOp::Update,
                data: ChangeSet {
                    old: Some("old".to_string()),
                    new: Some("new".to_string()),
                },
            },
            trigger: TriggerInfo {
                name: "message_changed".to_string(),
            },
            table: serde_json::json!({"name": "messages"}),
        };

        assert_eq!(envelope.effective_record(), Some(&"new".to_string()));
    }

    #[test]
    fn test_effective_record_falls_back_to_old() {
        let envelope = WebhookEnvelope::<String> {
            event: WebhookEvent {
                op: WebhookOp::Delete,
                data: ChangeSet {
                    old: Some("old".to_string()),
                    new: None,
                },
            },
            trigger: TriggerInfo {
                name: "message_deleted".to_string(),
            },
            table: serde_json::Value::Null,
        };

        assert_eq!(envelope.effective_record(), Some(&"old".to_string()));
    }

    #[test]
    fn test_strict_shape_rejects_missing_trigger() {
        let payload = serde_json::json!({
            "event": {"op": "INSERT", "data": {"old": null, "new": "x"}},
            "table": {}
        });

        let parsed: Result<WebhookEnvelope<String>, _> = serde_json::from_value(payload);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_manual_op_parses() {
        let op: WebhookOp = serde_json::from_str("\"MANUAL\"").unwrap();
        assert_eq!(op, WebhookOp::Manual);
    }
}
