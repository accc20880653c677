//! 好友关系数据结构与状态机

use crate::social::error::SocialError;
use crate::social::serialization::deserialize_null_default;
use crate::social::session::models::ProfileSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendStatus::Pending => "pending",
            FriendStatus::Accepted => "accepted",
            FriendStatus::Rejected => "rejected",
        }
    }
}

/// `friend_requests` 表的一行；每对用户最多一行（不分方向）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: FriendStatus,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl FriendRequest {
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// 关系中的另一方
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.sender_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// pending → accepted / 删除：只有接收方可以处理待处理的申请
    pub fn ensure_answerable_by(&self, user_id: &str) -> Result<(), SocialError> {
        if self.receiver_id != user_id {
            return Err(SocialError::Forbidden(
                "只有申请的接收方可以处理该申请".to_string(),
            ));
        }
        if self.status != FriendStatus::Pending {
            return Err(SocialError::InvalidState(format!(
                "申请状态为 {}，不是待处理",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    pub fn relationship_for(&self, user_id: &str) -> Relationship {
        match self.status {
            FriendStatus::Accepted => Relationship::Accepted,
            FriendStatus::Pending => Relationship::Pending {
                outgoing: self.sender_id == user_id,
            },
            FriendStatus::Rejected => Relationship::None,
        }
    }
}

/// 与某个用户的关系
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relationship {
    None,
    Pending { outgoing: bool },
    Accepted,
}

/// 好友列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Friend {
    pub id: String,
    pub name: String,
    pub handle: String,
    pub avatar: String,
    /// 对方发给我且未读的私信数
    pub unread_count: usize,
}

impl Friend {
    pub fn from_profile(profile: ProfileSummary, unread_count: usize) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            handle: profile.handle,
            avatar: profile.avatar,
            unread_count,
        }
    }

    /// 名字或 handle 包含关键字（不区分大小写）
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty()
            || self.name.to_lowercase().contains(&query)
            || self.handle.to_lowercase().contains(&query)
    }
}

/// 收到的待处理申请
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRequest {
    pub request: FriendRequest,
    pub sender: ProfileSummary,
}

/// 好友模块的状态快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FriendSnapshot {
    pub friends: Vec<Friend>,
    pub requests: Vec<PendingRequest>,
    pub selected_peer: Option<String>,
}
