//! Web API 层。
//!
//! 提供 Axum 路由：数据层变更触发器的回调入口与健康检查端点，
//! 入站信封经严格形状校验后重放进对应的消息/回应管线。

mod error;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
