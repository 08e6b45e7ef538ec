//! 变更动作信封
//!
//! `Action<T>` 为一次插入/更新/删除请求打上操作标记，发布后不可变。
//! 分发和回写两个消费角色各自独立消费同一个动作。

use serde::{Deserialize, Serialize};

/// 变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionOp {
    Insert,
    Update,
    Delete,
}

impl ActionOp {
    /// 操作名称（用于日志和监控）
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOp::Insert => "INSERT",
            ActionOp::Update => "UPDATE",
            ActionOp::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ActionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 变更动作信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action<T> {
    pub op: ActionOp,
    pub data: T,
}

impl<T> Action<T> {
    pub fn new(op: ActionOp, data: T) -> Self {
        Self { op, data }
    }

    pub fn insert(data: T) -> Self {
        Self::new(ActionOp::Insert, data)
    }

    pub fn update(data: T) -> Self {
        Self::new(ActionOp::Update, data)
    }

    pub fn delete(data: T) -> Self {
        Self::new(ActionOp::Delete, data)
    }
}
