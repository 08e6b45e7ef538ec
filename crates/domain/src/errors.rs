//! 领域层错误定义

use thiserror::Error;

/// 领域层错误类型
#[derive(Debug, Error)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {0}")]
    Validation(String),
}
