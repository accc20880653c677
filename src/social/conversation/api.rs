//! `messages` 表访问

use crate::social::conversation::models::Message;
use crate::social::store::{insert_as, select_as, tables, update_as, DataStore, Query};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 私信读写（以当前用户为视角）
#[derive(Clone)]
pub struct MessageApi {
    store: Arc<dyn DataStore>,
    user_id: String,
}

#[derive(Deserialize)]
struct SenderOnly {
    sender_id: String,
}

impl MessageApi {
    pub fn new(store: Arc<dyn DataStore>, user_id: String) -> Self {
        Self { store, user_id }
    }

    /// 双向的完整历史，按时间升序
    pub async fn fetch_thread(&self, peer_id: &str) -> Result<Vec<Message>> {
        let messages: Vec<Message> = select_as(
            self.store.as_ref(),
            tables::MESSAGES,
            &Query::new()
                .pair("sender_id", "receiver_id", &self.user_id, peer_id)
                .order("created_at", true),
        )
        .await
        .context("获取聊天记录失败")?;
        debug!(
            "[MessageAPI] 与 {} 的聊天记录: {} 条",
            peer_id,
            messages.len()
        );
        Ok(messages)
    }

    pub async fn send(&self, receiver_id: &str, content: &str) -> Result<Message> {
        insert_as(
            self.store.as_ref(),
            tables::MESSAGES,
            json!({
                "sender_id": self.user_id,
                "receiver_id": receiver_id,
                "content": content,
            }),
        )
        .await
        .context("发送私信失败")
    }

    /// 把 `sender_id` 发给我的未读私信全部标记为已读，返回变更条数
    pub async fn mark_read_from(&self, sender_id: &str) -> Result<usize> {
        let updated: Vec<Message> = update_as(
            self.store.as_ref(),
            tables::MESSAGES,
            &Query::new()
                .eq("sender_id", sender_id)
                .eq("receiver_id", self.user_id.as_str())
                .eq("is_read", false),
            json!({ "is_read": true }),
        )
        .await
        .context("标记私信已读失败")?;
        Ok(updated.len())
    }

    /// 发给我的未读私信数，按发送方分组
    pub async fn unread_counts(&self) -> Result<HashMap<String, usize>> {
        let rows: Vec<SenderOnly> = select_as(
            self.store.as_ref(),
            tables::MESSAGES,
            &Query::new()
                .columns("sender_id")
                .eq("receiver_id", self.user_id.as_str())
                .eq("is_read", false),
        )
        .await
        .context("统计未读私信失败")?;
        let mut counts = HashMap::new();
        for row in rows {
            *counts.entry(row.sender_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
