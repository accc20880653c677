//! `notifications` 表访问

use crate::social::notification::models::{NewNotification, Notification, NotificationKind};
use crate::social::store::{select_as, tables, DataStore, Query};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct NotificationApi {
    store: Arc<dyn DataStore>,
    user_id: String,
}

impl NotificationApi {
    pub fn new(store: Arc<dyn DataStore>, user_id: String) -> Self {
        Self { store, user_id }
    }

    /// 最新的一页通知（最新在前）
    pub async fn fetch_page(&self, limit: usize) -> Result<Vec<Notification>> {
        let page: Vec<Notification> = select_as(
            self.store.as_ref(),
            tables::NOTIFICATIONS,
            &Query::new()
                .eq("user_id", self.user_id.as_str())
                .order("created_at", false)
                .limit(limit),
        )
        .await
        .context("获取通知列表失败")?;
        debug!("[NotificationAPI] 获取通知 {} 条", page.len());
        Ok(page)
    }

    pub async fn mark_read(&self, notification_id: &str) -> Result<()> {
        self.store
            .update(
                tables::NOTIFICATIONS,
                &Query::new()
                    .eq("id", notification_id)
                    .eq("user_id", self.user_id.as_str()),
                json!({ "is_read": true }),
            )
            .await
            .context("标记通知已读失败")?;
        Ok(())
    }

    /// 来自 `source_id` 的未读私信通知标记为已读
    pub async fn mark_message_notifications_read(&self, source_id: &str) -> Result<usize> {
        let updated = self
            .store
            .update(
                tables::NOTIFICATIONS,
                &Query::new()
                    .eq("user_id", self.user_id.as_str())
                    .eq("type", NotificationKind::Message.as_str())
                    .eq("source_id", source_id)
                    .eq("is_read", false),
                json!({ "is_read": true }),
            )
            .await
            .context("标记私信通知已读失败")?;
        Ok(updated.len())
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        self.store
            .update(
                tables::NOTIFICATIONS,
                &Query::new()
                    .eq("user_id", self.user_id.as_str())
                    .eq("is_read", false),
                json!({ "is_read": true }),
            )
            .await
            .context("全部标记已读失败")?;
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.store
            .delete(
                tables::NOTIFICATIONS,
                &Query::new().eq("user_id", self.user_id.as_str()),
            )
            .await
            .context("清空通知失败")?;
        Ok(())
    }

    /// 给其他用户写一条通知
    pub async fn create(&self, notification: NewNotification) -> Result<()> {
        let row = serde_json::to_value(&notification).context("序列化通知失败")?;
        self.store
            .insert(tables::NOTIFICATIONS, row)
            .await
            .with_context(|| {
                format!(
                    "写入 {} 通知失败（接收方 {}）",
                    notification.kind.as_str(),
                    notification.user_id
                )
            })?;
        Ok(())
    }
}
