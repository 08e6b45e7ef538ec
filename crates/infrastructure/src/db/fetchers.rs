//! 权限缓存的回源实现
//!
//! 聊天室元数据与用户授权都从数据层读取。查不到任何行时返回 `None`，
//! 由缓存层记为哨兵并限速后续回源。

use application::{ApplicationError, ApplicationResult, Fetcher};
use domain::{ChatInfo, ConferenceGrant, GrantRole, UserGrants};
use sqlx::{PgPool, Row};

pub struct PgChatFetcher {
    pool: PgPool,
}

impl PgChatFetcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Fetcher<ChatInfo> for PgChatFetcher {
    async fn fetch(&self, key: &str) -> ApplicationResult<Option<ChatInfo>> {
        let row = sqlx::query(
            "SELECT conference_id, is_public, member_ids, pinned_sids FROM chats WHERE id = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ApplicationError::infrastructure_with_source("读取聊天室元数据失败", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let chat = ChatInfo {
            id: key.to_string(),
            conference_id: row
                .try_get("conference_id")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析聊天室行失败", e))?,
            is_public: row
                .try_get("is_public")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析聊天室行失败", e))?,
            member_ids: row
                .try_get("member_ids")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析聊天室行失败", e))?,
            pinned_sids: row
                .try_get("pinned_sids")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析聊天室行失败", e))?,
        };
        Ok(Some(chat))
    }
}

pub struct PgGrantsFetcher {
    pool: PgPool,
}

impl PgGrantsFetcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Fetcher<UserGrants> for PgGrantsFetcher {
    async fn fetch(&self, key: &str) -> ApplicationResult<Option<UserGrants>> {
        let rows =
            sqlx::query("SELECT conference_id, role FROM conference_grants WHERE user_id = $1")
                .bind(key)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    ApplicationError::infrastructure_with_source("读取用户授权失败", e)
                })?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut grants = Vec::with_capacity(rows.len());
        for row in rows {
            let conference_id: String = row
                .try_get("conference_id")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析授权行失败", e))?;
            let role: String = row
                .try_get("role")
                .map_err(|e| ApplicationError::infrastructure_with_source("解析授权行失败", e))?;

            // 未知角色按最低权限处理
            let role = match role.as_str() {
                "moderator" => GrantRole::Moderator,
                "attendee" => GrantRole::Attendee,
                other => {
                    tracing::warn!(user_id = key, role = other, "未知角色，按 attendee 处理");
                    GrantRole::Attendee
                }
            };
            grants.push(ConferenceGrant {
                conference_id,
                role,
            });
        }

        Ok(Some(UserGrants {
            user_id: key.to_string(),
            grants,
        }))
    }
}
