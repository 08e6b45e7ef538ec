//! Postgres 动作存储
//!
//! 插入走 QueryBuilder 批量拼接，`ON CONFLICT (s_id) DO NOTHING` 保证
//! 按幂等键重复插入是无效果的成功。更新/删除按幂等键逐条执行，调用方
//! 依赖 `rows_affected` 区分"未命中"与"已生效"。
//!
//! 错误分为网络层（连接断开、池超时，整批重投可恢复）和数据层（约束
//! 冲突、类型不符，重试无益）两类，由回写工作器分别处置。

pub mod fetchers;
pub mod message_store;
pub mod reaction_store;

pub use fetchers::{PgChatFetcher, PgGrantsFetcher};
pub use message_store::PgMessageStore;
pub use reaction_store::PgReactionStore;

use application::StoreError;
use sqlx::PgPool;

/// sqlx 错误分类：网络层可重投，其余按数据错误处理
pub(crate) fn map_store_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Network(err.to_string()),
        _ => StoreError::Data(err.to_string()),
    }
}

/// 数据库连通性探测（健康检查端点用）
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
