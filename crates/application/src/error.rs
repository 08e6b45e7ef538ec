//! 应用层错误定义
//!
//! 错误分类决定了调用方的处理方式：验证错误丢弃请求、权限错误对请求方
//! 静默、基础设施错误交给连接层重连重投、持久化数据错误记录后放弃。

use domain::DomainError;
use thiserror::Error;

/// 应用层错误类型
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// 入站负载形状不合法，记录日志后丢弃，不会导致进程退出
    #[error("验证失败: {0}")]
    Validation(String),

    /// 权限不足。对请求方不返回可区分的错误，避免泄露资源是否存在
    #[error("权限不足")]
    PermissionDenied,

    /// 分布式存储/消息代理暂时不可达，由连接层退避重连
    #[error("基础设施错误: {0}")]
    Infrastructure(String),

    /// 单条记录在逐条重试后仍然失败，记录为运维可见事件后放弃
    #[error("持久化数据错误: {0}")]
    PersistentData(String),

    /// 锁获取超时，调用方中止本次操作，由终端用户重试
    #[error("锁获取超时: {0}")]
    LockTimeout(String),

    /// 并发冲突（乐观对账重试耗尽）
    #[error("并发冲突: {0}")]
    Conflict(String),
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn infrastructure_with_source(
        message: impl Into<String>,
        source: impl std::fmt::Display,
    ) -> Self {
        ApplicationError::Infrastructure(format!("{}: {}", message.into(), source))
    }
}

impl From<DomainError> for ApplicationError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => ApplicationError::Validation(msg),
        }
    }
}

/// 应用层结果类型
pub type ApplicationResult<T> = Result<T, ApplicationError>;
