//! 消息的 Postgres 存储

use crate::db::map_store_err;
use application::{ActionStore, StoreError};
use domain::Message;
use sqlx::PgPool;

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ActionStore<Message> for PgMessageStore {
    async fn bulk_insert(&self, items: &[Message]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO messages (s_id, chat_id, user_id, user_name, text, created_at) ",
        );

        query_builder.push_values(items, |mut b, message| {
            b.push_bind(&message.sid)
                .push_bind(&message.chat_id)
                .push_bind(&message.user_id)
                .push_bind(&message.user_name)
                .push_bind(&message.text)
                .push_bind(message.created_at);
        });
        query_builder.push(" ON CONFLICT (s_id) DO NOTHING");

        query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;

        tracing::debug!(batch_size = items.len(), "消息批量插入完成");
        Ok(())
    }

    async fn insert_one(&self, item: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (s_id, chat_id, user_id, user_name, text, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (s_id) DO NOTHING",
        )
        .bind(&item.sid)
        .bind(&item.chat_id)
        .bind(&item.user_id)
        .bind(&item.user_name)
        .bind(&item.text)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;
        Ok(())
    }

    async fn update_one(&self, item: &Message) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE messages SET text = $1, updated_at = $2 WHERE s_id = $3")
            .bind(&item.text)
            .bind(item.updated_at)
            .bind(&item.sid)
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_one(&self, item: &Message) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE s_id = $1")
            .bind(&item.sid)
            .execute(&self.pool)
            .await
            .map_err(map_store_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    // 批量插入、rows_affected 语义的端到端验证见 tests/pg_stores.rs，
    // 需要数据库连接（DATABASE_INTEGRATION_TEST）
}
