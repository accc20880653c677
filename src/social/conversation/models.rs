use crate::social::serialization::deserialize_null_default;
use serde::{Deserialize, Serialize};

/// `messages` 表的一行，写入后只有 `is_read` 会变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_read: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: String,
}

impl Message {
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// 会话视图快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSnapshot {
    /// 当前打开的对端，`None` 表示未打开
    pub peer_id: Option<String>,
    /// 按时间升序
    pub messages: Vec<Message>,
}
