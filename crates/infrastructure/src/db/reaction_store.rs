//! 表情回应的 Postgres 存储

use crate::db::map_store_err;
use application::{ActionStore, StoreError};
use domain::Reaction;
use sqlx::PgPool;

pub struct PgReactionStore {
    pool: PgPool,
}

impl PgReactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ActionStore<Reaction> for PgReactionStore {
    async fn bulk_insert(&self, items: &[Reaction]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO reactions (s_id, chat_id, message_s_id, user_id, kind, created_at) ",
        );

        query_builder.push_values(items, |mut b, reaction| {
            b.push_bind(&reaction.sid)
                .push_bind(&reaction.chat_id)
                .push_bind(&reaction.message_sid)
                .push_bind(&reaction.user_id)
                .push_bind(&reaction.kind)
                .push_bind(reaction.created_at);
        });
        query_builder.push(" ON CONFLICT (s_id) DO NOTHING");

        query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;

        tracing::debug!(batch_size = items.len(), "回应批量插入完成");
        Ok(())
    }

    async fn insert_one(&self, item: &Reaction) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reactions (s_id, chat_id, message_s_id, user_id, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (s_id) DO NOTHING",
        )
        .bind(&item.sid)
        .bind(&item.chat_id)
        .bind(&item.message_sid)
        .bind(&item.user_id)
        .bind(&item.kind)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;
        Ok(())
    }

    async fn update_one(&self, item: &Reaction) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE reactions SET kind = $1, updated_at = $2 WHERE s_id = $3")
            .bind(&item.kind)
            .bind(item.updated_at)
            .bind(&item.sid)
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_one(&self, item: &Reaction) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM reactions WHERE s_id = $1")
            .bind(&item.sid)
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;
        Ok(result.rows_affected())
    }
}
