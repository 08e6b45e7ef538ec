use application::{MessageService, ReactionService};
use sqlx::PgPool;
use std::sync::Arc;

/// 路由层共享状态
#[derive(Clone)]
pub struct AppState {
    pub message_service: Arc<MessageService>,
    pub reaction_service: Arc<ReactionService>,
    pub db_pool: PgPool,
}

impl AppState {
    pub fn new(
        message_service: Arc<MessageService>,
        reaction_service: Arc<ReactionService>,
        db_pool: PgPool,
    ) -> Self {
        Self {
            message_service,
            reaction_service,
            db_pool,
        }
    }
}
