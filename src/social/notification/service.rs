//! 通知 / 未读数对账
//!
//! 本地只保存最新一页通知与未读数；启动时以及 `notifications:{me}` 上的每个实时事件后
//! 重新拉取整页并重算未读数，服务端列表始终是权威来源。

use crate::social::config::ClientConfig;
use crate::social::conversation::api::MessageApi;
use crate::social::notification::api::NotificationApi;
use crate::social::notification::listener::{EmptyNotificationListener, NotificationListener};
use crate::social::notification::models::NotificationSnapshot;
use crate::social::realtime::{ChangeFilter, ChannelTask, Changefeed};
use crate::social::store::tables;
use crate::social::Backend;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct NotificationCenter {
    user_id: String,
    page_size: usize,
    api: NotificationApi,
    messages: MessageApi,
    realtime: Arc<dyn Changefeed>,
    state: Mutex<NotificationSnapshot>,
    /// 每次对账完成后递增
    trigger: watch::Sender<u64>,
    /// 最近一次发起的拉取序号，较早发起的拉取结果会被丢弃
    fetch_seq: AtomicU64,
    listener: Arc<dyn NotificationListener>,
    task: Mutex<Option<ChannelTask>>,
}

impl NotificationCenter {
    pub fn new(backend: &Backend, config: &ClientConfig, user_id: &str) -> Self {
        Self::with_listener(backend, config, user_id, Arc::new(EmptyNotificationListener))
    }

    pub fn with_listener(
        backend: &Backend,
        config: &ClientConfig,
        user_id: &str,
        listener: Arc<dyn NotificationListener>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            page_size: config.notification_page_size,
            api: NotificationApi::new(backend.store.clone(), user_id.to_string()),
            messages: MessageApi::new(backend.store.clone(), user_id.to_string()),
            realtime: backend.realtime.clone(),
            state: Mutex::new(NotificationSnapshot::default()),
            trigger: watch::Sender::new(0),
            fetch_seq: AtomicU64::new(0),
            listener,
            task: Mutex::new(None),
        }
    }

    /// 首次拉取并订阅 `notifications:{me}`；订阅失败时只在打开时拉取
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("[Notification] 🚀 启动通知中心: {}", self.user_id);
        if let Err(e) = self.fetch_notifications().await {
            error!("[Notification] ❌ 首次拉取通知失败: {:#}", e);
        }

        let channel = format!("notifications:{}", self.user_id);
        let filter = ChangeFilter::table(tables::NOTIFICATIONS).where_eq("user_id", &self.user_id);
        match self.realtime.subscribe(&channel, filter).await {
            Ok(subscription) => {
                let center = Arc::downgrade(self);
                let task = ChannelTask::spawn(subscription, move |event| {
                    let center = center.clone();
                    async move {
                        let Some(center) = Weak::upgrade(&center) else {
                            return false;
                        };
                        debug!("[Notification] 📨 通知变更: {:?}", event.kind());
                        if let Err(e) = center.fetch_notifications().await {
                            error!("[Notification] ❌ 事件后重新拉取失败: {:#}", e);
                        }
                        true
                    }
                });
                *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
                info!("[Notification] ✅ 已订阅通道: {}", channel);
            }
            Err(e) => warn!("[Notification] ⚠️ 订阅 {} 失败，仅在打开时刷新: {}", channel, e),
        }
        Ok(())
    }

    /// 取消订阅
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            info!("[Notification] 🛑 停止通知中心: {}", task.channel());
        }
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn unread_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).unread_count
    }

    /// 每次对账后递增的计数器，好友列表据此刷新未读徽标
    pub fn trigger(&self) -> watch::Receiver<u64> {
        self.trigger.subscribe()
    }

    /// 替换快照并通知监听器
    ///
    /// 带 `seq` 时只有它仍是最新一次拉取才会替换，比较与替换在同一把锁内完成。
    async fn publish(&self, snapshot: NotificationSnapshot, seq: Option<u64>) -> bool {
        let previous_unread = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if seq.is_some_and(|seq| self.fetch_seq.load(Ordering::SeqCst) != seq) {
                return false;
            }
            std::mem::replace(&mut *state, snapshot.clone()).unread_count
        };
        let unread = snapshot.unread_count;
        self.listener.on_notifications_changed(snapshot).await;
        if unread != previous_unread {
            self.listener.on_unread_count_changed(unread).await;
        }
        self.trigger.send_modify(|n| *n += 1);
        true
    }

    /// 重新拉取最新一页并重算未读数；失败时保留上一次的列表
    pub async fn fetch_notifications(&self) -> Result<NotificationSnapshot> {
        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let page = self.api.fetch_page(self.page_size).await?;
        let snapshot = NotificationSnapshot::from_page(page);
        if !self.publish(snapshot.clone(), Some(seq)).await {
            debug!("[Notification] 丢弃过期的拉取结果 #{}", seq);
            return Ok(self.snapshot());
        }
        debug!(
            "[Notification] 🔄 对账完成: {} 条, 未读 {}",
            snapshot.notifications.len(),
            snapshot.unread_count
        );
        Ok(snapshot)
    }

    pub async fn mark_as_read(&self, notification_id: &str) -> Result<()> {
        self.api.mark_read(notification_id).await?;
        self.fetch_notifications().await?;
        Ok(())
    }

    /// 把 `sender_id` 发来的私信与对应的私信通知一并标记已读（可重复调用）
    pub async fn mark_messages_as_read(&self, sender_id: &str) -> Result<()> {
        let messages = self.messages.mark_read_from(sender_id).await?;
        let notifications = self.api.mark_message_notifications_read(sender_id).await?;
        debug!(
            "[Notification] ✅ {} 的私信已读: 私信 {} 条, 通知 {} 条",
            sender_id, messages, notifications
        );
        self.fetch_notifications().await?;
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> Result<()> {
        self.api.mark_all_read().await?;
        self.fetch_notifications().await?;
        Ok(())
    }

    /// 乐观清空；服务端失败时恢复为清空前的快照
    pub async fn clear_all_notifications(&self) -> Result<()> {
        let previous = self.snapshot();
        self.publish(NotificationSnapshot::default(), None).await;
        if let Err(e) = self.api.delete_all().await {
            warn!("[Notification] ⚠️ 清空失败，恢复原列表: {:#}", e);
            // 作废清空前已发起的拉取
            self.fetch_seq.fetch_add(1, Ordering::SeqCst);
            self.publish(previous, None).await;
            return Err(e);
        }
        info!("[Notification] 🧹 已清空 {} 条通知", previous.notifications.len());
        Ok(())
    }
}
