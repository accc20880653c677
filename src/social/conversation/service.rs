//! 会话视图
//!
//! 同一时间只打开一个对端。每次 `open` 递增 epoch，
//! 晚于切换或关闭才返回的拉取结果与实时事件都会被丢弃。
//! 已读标记只在打开时调用一次，收到对端新私信时在同一处理函数里再次标记。

use crate::social::conversation::api::MessageApi;
use crate::social::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::social::conversation::models::{ConversationSnapshot, Message};
use crate::social::error::SocialError;
use crate::social::friend::service::FriendService;
use crate::social::notification::api::NotificationApi;
use crate::social::notification::models::NewNotification;
use crate::social::notification::service::NotificationCenter;
use crate::social::realtime::{Change, ChangeEvent, ChangeFilter, ChangeKind, ChannelTask, Changefeed};
use crate::social::session::models::Identity;
use crate::social::store::tables;
use crate::social::Backend;
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct ConversationState {
    peer: Option<String>,
    messages: Vec<Message>,
    epoch: u64,
}

impl ConversationState {
    fn is_current(&self, epoch: u64, peer_id: &str) -> bool {
        self.epoch == epoch && self.peer.as_deref() == Some(peer_id)
    }
}

pub struct ConversationView {
    identity: Identity,
    api: MessageApi,
    notifications: NotificationApi,
    center: Arc<NotificationCenter>,
    friends: Arc<FriendService>,
    realtime: Arc<dyn Changefeed>,
    state: Mutex<ConversationState>,
    listener: Arc<dyn ConversationListener>,
    task: Mutex<Option<ChannelTask>>,
}

impl ConversationView {
    pub fn new(
        backend: &Backend,
        identity: Identity,
        center: Arc<NotificationCenter>,
        friends: Arc<FriendService>,
    ) -> Self {
        Self::with_listener(
            backend,
            identity,
            center,
            friends,
            Arc::new(EmptyConversationListener),
        )
    }

    pub fn with_listener(
        backend: &Backend,
        identity: Identity,
        center: Arc<NotificationCenter>,
        friends: Arc<FriendService>,
        listener: Arc<dyn ConversationListener>,
    ) -> Self {
        Self {
            api: MessageApi::new(backend.store.clone(), identity.id.clone()),
            notifications: NotificationApi::new(backend.store.clone(), identity.id.clone()),
            realtime: backend.realtime.clone(),
            center,
            friends,
            state: Mutex::new(ConversationState::default()),
            listener,
            task: Mutex::new(None),
            identity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer(&self) -> Option<String> {
        self.lock().peer.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let state = self.lock();
        ConversationSnapshot {
            peer_id: state.peer.clone(),
            messages: state.messages.clone(),
        }
    }

    /// 打开与 `peer_id` 的会话
    ///
    /// 订阅 `chat_room:{peer}`，拉取完整历史，把对端发来的私信及其通知标记为已读，
    /// 并清零好友列表中的未读徽标。
    pub async fn open(self: &Arc<Self>, peer_id: &str) -> Result<Vec<Message>> {
        let epoch = {
            let mut state = self.lock();
            state.epoch += 1;
            state.peer = Some(peer_id.to_string());
            state.messages.clear();
            state.epoch
        };
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!("[Conversation] 💬 打开会话: {} (epoch {})", peer_id, epoch);
        self.friends.select_peer(peer_id).await;

        let channel = format!("chat_room:{}", peer_id);
        let filter = ChangeFilter::table(tables::MESSAGES)
            .on(ChangeKind::Insert)
            .where_eq("receiver_id", &self.identity.id);
        match self.realtime.subscribe(&channel, filter).await {
            Ok(subscription) => {
                let view = Arc::downgrade(self);
                let task = ChannelTask::spawn(subscription, move |event| {
                    let view = view.clone();
                    async move {
                        match Weak::upgrade(&view) {
                            Some(view) => view.handle_incoming(epoch, event).await,
                            None => false,
                        }
                    }
                });
                if self.lock().epoch == epoch {
                    *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
                }
            }
            Err(e) => warn!(
                "[Conversation] ⚠️ 订阅 {} 失败，只显示打开时的历史: {}",
                channel, e
            ),
        }

        // 历史返回前已切换或关闭：该会话从未展示，不标记已读
        let Some(messages) = self.reload(epoch, peer_id).await? else {
            return Ok(Vec::new());
        };

        if let Err(e) = self.center.mark_messages_as_read(peer_id).await {
            warn!("[Conversation] ⚠️ 标记 {} 的私信已读失败: {:#}", peer_id, e);
        }
        if self.lock().is_current(epoch, peer_id) {
            self.friends.clear_unread(peer_id).await;
        }
        Ok(messages)
    }

    /// 重新拉取完整历史；会话已切换时丢弃结果并返回 `None`
    async fn reload(&self, epoch: u64, peer_id: &str) -> Result<Option<Vec<Message>>> {
        let messages = self.api.fetch_thread(peer_id).await?;
        {
            let mut state = self.lock();
            if !state.is_current(epoch, peer_id) {
                debug!("[Conversation] 丢弃过期的聊天记录: {} (epoch {})", peer_id, epoch);
                return Ok(None);
            }
            state.messages = messages.clone();
        }
        self.listener
            .on_messages_changed(peer_id.to_string(), messages.clone())
            .await;
        Ok(Some(messages))
    }

    /// 处理发给我的新私信；返回 `false` 表示该通道已过期
    async fn handle_incoming(&self, epoch: u64, event: ChangeEvent) -> bool {
        let ChangeEvent::Message(Change::Insert(message)) = event else {
            return true;
        };
        if message.receiver_id != self.identity.id {
            return true;
        }
        let peer_id = message.sender_id.clone();
        let messages = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return false;
            }
            if state.peer.as_deref() != Some(peer_id.as_str()) {
                return true;
            }
            if state.messages.iter().any(|m| m.id == message.id) {
                return true;
            }
            state.messages.push(message.clone());
            state.messages.clone()
        };
        debug!("[Conversation] 📨 收到 {} 的新私信: {}", peer_id, message.id);
        self.listener.on_new_message(message).await;
        self.listener
            .on_messages_changed(peer_id.clone(), messages)
            .await;

        if let Err(e) = self.center.mark_messages_as_read(&peer_id).await {
            warn!("[Conversation] ⚠️ 标记新私信已读失败: {:#}", e);
        }
        self.friends.clear_unread(&peer_id).await;
        true
    }

    /// 向当前会话发送私信，发送后重新拉取完整历史
    pub async fn send(&self, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(SocialError::Validation("消息内容不能为空".to_string()).into());
        }
        let (epoch, peer_id) = {
            let state = self.lock();
            match &state.peer {
                Some(peer) => (state.epoch, peer.clone()),
                None => {
                    return Err(SocialError::InvalidState("没有打开的会话".to_string()).into())
                }
            }
        };

        let message = self.deliver(&peer_id, content).await?;
        if let Err(e) = self.reload(epoch, &peer_id).await {
            error!("[Conversation] ❌ 发送后刷新聊天记录失败: {:#}", e);
        }
        Ok(message)
    }

    /// 不打开会话直接发送（例如从资料页）
    pub async fn send_direct(&self, peer_id: &str, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(SocialError::Validation("消息内容不能为空".to_string()).into());
        }
        self.deliver(peer_id, content).await
    }

    /// 写入私信并给接收方写一条私信通知（通知失败不影响发送结果）
    async fn deliver(&self, peer_id: &str, content: &str) -> Result<Message> {
        let message = self.api.send(peer_id, content).await?;
        info!("[Conversation] ✅ 已发送私信给 {}: {}", peer_id, message.id);
        let notification = NewNotification::message(peer_id, &self.identity, content);
        if let Err(e) = self.notifications.create(notification).await {
            warn!("[Conversation] ⚠️ 私信通知写入失败: {:#}", e);
        }
        Ok(message)
    }

    /// 关闭当前会话并取消订阅
    pub fn close(&self) {
        let previous = {
            let mut state = self.lock();
            state.epoch += 1;
            state.messages.clear();
            state.peer.take()
        };
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.friends.deselect();
        if let Some(peer) = previous {
            info!("[Conversation] 关闭会话: {}", peer);
        }
    }
}
