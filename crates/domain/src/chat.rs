//! 聊天室元数据与用户授权
//!
//! 这两个结构是权限判定的缓存值：聊天室的可见性/归属会议/成员列表，
//! 以及用户在各会议范围内的授权集合。

use serde::{Deserialize, Serialize};

/// 聊天室元数据（缓存值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: String,
    /// 归属会议
    pub conference_id: String,
    /// 公开房间对会议内所有人可见；非公开房间额外要求成员资格
    pub is_public: bool,
    /// 非公开房间的成员列表
    pub member_ids: Vec<String>,
    /// 置顶消息的 sId 集合
    #[serde(default)]
    pub pinned_sids: Vec<String>,
}

impl ChatInfo {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == user_id)
    }

    /// 切换某条消息的置顶状态，返回切换后的状态
    pub fn toggle_pin(&mut self, sid: &str) -> bool {
        if let Some(pos) = self.pinned_sids.iter().position(|p| p == sid) {
            self.pinned_sids.remove(pos);
            false
        } else {
            self.pinned_sids.push(sid.to_string());
            true
        }
    }
}

/// 会议范围内的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantRole {
    Attendee,
    Moderator,
}

/// 单个会议范围内的授权
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceGrant {
    pub conference_id: String,
    pub role: GrantRole,
}

/// 用户授权集合（缓存值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGrants {
    pub user_id: String,
    pub grants: Vec<ConferenceGrant>,
}

impl UserGrants {
    /// 用户是否与该会议有授权关联
    pub fn has_conference(&self, conference_id: &str) -> bool {
        self.grants.iter().any(|g| g.conference_id == conference_id)
    }

    pub fn is_moderator(&self, conference_id: &str) -> bool {
        self.grants
            .iter()
            .any(|g| g.conference_id == conference_id && g.role == GrantRole::Moderator)
    }
}
