//! 变更载荷
//!
//! 实时通道推送的是松散的 JSON，在边界处立即转换为带类型的 `ChangeEvent`，
//! 业务模块只处理强类型事件。

use crate::social::conversation::models::Message;
use crate::social::friend::models::FriendRequest;
use crate::social::notification::models::Notification;
use crate::social::store::tables;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// 通道推送的原始变更
#[derive(Debug, Clone, Deserialize)]
pub struct RawChange {
    #[serde(default)]
    pub schema: String,
    pub table: String,
    #[serde(rename = "type", alias = "eventType")]
    pub kind: ChangeKind,
    #[serde(default, rename = "record", alias = "new")]
    pub new_record: Value,
    #[serde(default, rename = "old_record", alias = "old")]
    pub old_record: Value,
}

impl RawChange {
    pub fn new(table: &str, kind: ChangeKind, new_record: Value, old_record: Value) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            kind,
            new_record,
            old_record,
        }
    }

    /// 用于过滤的行：删除事件取旧行，其余取新行
    pub fn record(&self) -> &Value {
        match self.kind {
            ChangeKind::Delete => &self.old_record,
            _ => &self.new_record,
        }
    }
}

/// 一次带类型的行变更
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert(T),
    Update { old: Option<T>, new: T },
    Delete(T),
}

impl<T> Change<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Insert(_) => ChangeKind::Insert,
            Change::Update { .. } => ChangeKind::Update,
            Change::Delete(_) => ChangeKind::Delete,
        }
    }

    /// 变更后的行；删除事件返回被删除的行
    pub fn row(&self) -> &T {
        match self {
            Change::Insert(row) | Change::Delete(row) => row,
            Change::Update { new, .. } => new,
        }
    }

    /// 变更涉及的所有行（更新事件含旧行）
    pub fn rows(&self) -> Vec<&T> {
        match self {
            Change::Insert(row) | Change::Delete(row) => vec![row],
            Change::Update { old, new } => old.iter().chain(std::iter::once(new)).collect(),
        }
    }
}

/// 带类型的变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    FriendRequest(Change<FriendRequest>),
    Message(Change<Message>),
    Notification(Change<Notification>),
    /// 未建模的表，只保留表名与类型
    Other { table: String, kind: ChangeKind },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::FriendRequest(c) => c.kind(),
            ChangeEvent::Message(c) => c.kind(),
            ChangeEvent::Notification(c) => c.kind(),
            ChangeEvent::Other { kind, .. } => *kind,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::FriendRequest(_) => tables::FRIEND_REQUESTS,
            ChangeEvent::Message(_) => tables::MESSAGES,
            ChangeEvent::Notification(_) => tables::NOTIFICATIONS,
            ChangeEvent::Other { table, .. } => table,
        }
    }
}

fn typed<T: DeserializeOwned>(raw: RawChange) -> Result<Change<T>, serde_json::Error> {
    Ok(match raw.kind {
        ChangeKind::Insert => Change::Insert(serde_json::from_value(raw.new_record)?),
        ChangeKind::Update => Change::Update {
            // 旧行可能只含主键，解析失败时丢弃
            old: serde_json::from_value(raw.old_record).ok(),
            new: serde_json::from_value(raw.new_record)?,
        },
        ChangeKind::Delete => Change::Delete(serde_json::from_value(raw.old_record)?),
    })
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = serde_json::Error;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        Ok(match raw.table.as_str() {
            tables::FRIEND_REQUESTS => ChangeEvent::FriendRequest(typed(raw)?),
            tables::MESSAGES => ChangeEvent::Message(typed(raw)?),
            tables::NOTIFICATIONS => ChangeEvent::Notification(typed(raw)?),
            _ => ChangeEvent::Other {
                kind: raw.kind,
                table: raw.table,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::friend::models::FriendStatus;
    use serde_json::json;

    #[test]
    fn test_friend_request_update() {
        let raw: RawChange = serde_json::from_value(json!({
            "schema": "public",
            "table": "friend_requests",
            "type": "UPDATE",
            "commit_timestamp": "2024-05-01T10:00:00Z",
            "record": {"id": "r1", "sender_id": "a", "receiver_id": "b", "status": "accepted",
                       "created_at": "2024-05-01T09:00:00Z", "updated_at": "2024-05-01T10:00:00Z"},
            "old_record": {"id": "r1"}
        }))
        .unwrap();
        let event = ChangeEvent::try_from(raw).unwrap();
        match event {
            ChangeEvent::FriendRequest(Change::Update { old, new }) => {
                assert!(old.is_none());
                assert_eq!(new.status, FriendStatus::Accepted);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_message_insert() {
        let raw: RawChange = serde_json::from_value(json!({
            "table": "messages",
            "eventType": "INSERT",
            "new": {"id": "m1", "sender_id": "b", "receiver_id": "a", "content": "hola",
                    "is_read": false, "created_at": "2024-05-01T10:00:00Z"},
            "old": {}
        }))
        .unwrap();
        let event = ChangeEvent::try_from(raw).unwrap();
        assert_eq!(event.kind(), ChangeKind::Insert);
        assert_eq!(event.table(), "messages");
        match event {
            ChangeEvent::Message(change) => assert_eq!(change.row().content, "hola"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_delete_uses_old_record() {
        let raw = RawChange::new(
            "friend_requests",
            ChangeKind::Delete,
            Value::Null,
            json!({"id": "r1", "sender_id": "a", "receiver_id": "b", "status": "pending"}),
        );
        assert_eq!(raw.record()["sender_id"], "a");
        match ChangeEvent::try_from(raw).unwrap() {
            ChangeEvent::FriendRequest(change) => {
                assert_eq!(change.kind(), ChangeKind::Delete);
                assert_eq!(change.rows().len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unmodelled_table() {
        let raw = RawChange::new("posts", ChangeKind::Update, json!({"id": "p1"}), Value::Null);
        assert_eq!(
            ChangeEvent::try_from(raw).unwrap(),
            ChangeEvent::Other {
                table: "posts".into(),
                kind: ChangeKind::Update
            }
        );
    }

    #[test]
    fn test_malformed_row_is_rejected() {
        let raw = RawChange::new("messages", ChangeKind::Insert, json!({"id": 1}), Value::Null);
        assert!(ChangeEvent::try_from(raw).is_err());
    }
}
