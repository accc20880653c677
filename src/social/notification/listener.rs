//! 通知监听器回调接口

use crate::social::notification::models::NotificationSnapshot;
use async_trait::async_trait;

#[async_trait]
pub trait NotificationListener: Send + Sync {
    /// 通知列表重新对账后的完整快照
    async fn on_notifications_changed(&self, snapshot: NotificationSnapshot);

    /// 未读数发生变化
    async fn on_unread_count_changed(&self, unread_count: usize);
}

/// 默认空实现（无操作）
pub struct EmptyNotificationListener;

#[async_trait]
impl NotificationListener for EmptyNotificationListener {
    async fn on_notifications_changed(&self, _snapshot: NotificationSnapshot) {
        // 默认不做任何处理
    }

    async fn on_unread_count_changed(&self, _unread_count: usize) {
        // 默认不做任何处理
    }
}
