use crate::social::serialization::deserialize_null_default;
use crate::social::session::models::Identity;
use serde::{Deserialize, Serialize};

/// 消息通知中内容预览的最大字符数
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    RequestAccepted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::RequestAccepted => "request_accepted",
        }
    }
}

/// `notifications` 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_handle: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_avatar: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_read: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: String,
}

/// 待写入的通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewNotification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub content: String,
    pub source_id: String,
    pub source_handle: String,
    pub source_avatar: String,
}

impl NewNotification {
    fn from_source(user_id: &str, kind: NotificationKind, source: &Identity) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
            title: String::new(),
            content: String::new(),
            source_id: source.id.clone(),
            source_handle: source.handle.clone(),
            source_avatar: source.avatar.clone(),
        }
    }

    /// 通知对方收到新的好友申请
    pub fn friend_request(target_id: &str, sender: &Identity) -> Self {
        Self {
            title: "Nueva Solicitud de Alianza".to_string(),
            content: format!("{} quiere formar una alianza contigo.", sender.handle),
            ..Self::from_source(target_id, NotificationKind::FriendRequest, sender)
        }
    }

    /// 通知申请发起方：申请已被接受
    pub fn request_accepted(sender_id: &str, accepter: &Identity) -> Self {
        Self {
            title: "¡Alianza Aceptada!".to_string(),
            content: format!("{} ha aceptado tu solicitud de alianza.", accepter.handle),
            ..Self::from_source(sender_id, NotificationKind::RequestAccepted, accepter)
        }
    }

    /// 新私信提醒，内容为截断后的预览
    pub fn message(receiver_id: &str, sender: &Identity, content: &str) -> Self {
        let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
        if content.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        Self {
            title: "Nuevo Mensaje".to_string(),
            content: format!("{}: {}", sender.handle, preview),
            ..Self::from_source(receiver_id, NotificationKind::Message, sender)
        }
    }
}

/// 通知中心的状态快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSnapshot {
    /// 最新在前，最多一页
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

impl NotificationSnapshot {
    pub fn from_page(notifications: Vec<Notification>) -> Self {
        let unread_count = notifications.iter().filter(|n| !n.is_read).count();
        Self {
            notifications,
            unread_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_row() {
        let row: Notification = serde_json::from_value(serde_json::json!({
            "id": "n1", "user_id": "u2", "type": "request_accepted",
            "title": "¡Alianza Aceptada!", "content": null,
            "source_id": "u1", "source_handle": "@nova", "source_avatar": null,
            "is_read": false, "created_at": "2024-05-01T10:00:00+00:00"
        }))
        .unwrap();
        assert_eq!(row.kind, NotificationKind::RequestAccepted);
        assert_eq!(row.content, "");
        assert_eq!(row.source_avatar, "");
    }

    #[test]
    fn test_derived_notifications() {
        let nova = Identity::guest("u1", "nova@space.io");
        let accepted = NewNotification::request_accepted("u2", &nova);
        assert_eq!(accepted.user_id, "u2");
        assert_eq!(accepted.source_id, "u1");
        assert_eq!(accepted.content, "@user ha aceptado tu solicitud de alianza.");

        let long = "x".repeat(200);
        let message = NewNotification::message("u2", &nova, &long);
        assert_eq!(message.kind, NotificationKind::Message);
        assert!(message.content.ends_with('…'));
        assert_eq!(
            serde_json::to_value(&message).unwrap()["type"],
            serde_json::json!("message")
        );
    }

    #[test]
    fn test_snapshot_counts_unread() {
        let make = |id: &str, is_read: bool| Notification {
            id: id.into(),
            user_id: "u1".into(),
            kind: NotificationKind::Message,
            title: String::new(),
            content: String::new(),
            source_id: "u2".into(),
            source_handle: String::new(),
            source_avatar: String::new(),
            is_read,
            created_at: String::new(),
        };
        let snapshot = NotificationSnapshot::from_page(vec![make("a", false), make("b", true), make("c", false)]);
        assert_eq!(snapshot.unread_count, 2);
    }
}
