//! 客户端入口
//!
//! `SocialClient` 持有会话存储，登录成功后为当前用户组装一组视图模型
//! （通知中心、好友服务、会话视图、社区动态），登出时全部拆除并取消订阅。

use crate::social::config::ClientConfig;
use crate::social::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::social::conversation::service::ConversationView;
use crate::social::feed::listener::{EmptyFeedListener, FeedListener};
use crate::social::feed::service::FeedView;
use crate::social::friend::listener::{EmptyFriendListener, FriendListener};
use crate::social::friend::service::FriendService;
use crate::social::notification::listener::{EmptyNotificationListener, NotificationListener};
use crate::social::notification::service::NotificationCenter;
use crate::social::session::listener::{EmptySessionListener, SessionListener};
use crate::social::session::models::{Identity, Registration};
use crate::social::session::service::SessionStore;
use crate::social::Backend;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// 一次登录对应的视图模型集合
#[derive(Clone)]
pub struct ActiveSession {
    pub identity: Identity,
    pub notifications: Arc<NotificationCenter>,
    pub friends: Arc<FriendService>,
    pub conversation: Arc<ConversationView>,
    pub feed: Arc<FeedView>,
}

impl ActiveSession {
    /// 关闭会话并取消所有实时订阅
    pub fn shutdown(&self) {
        self.conversation.close();
        self.friends.stop();
        self.notifications.stop();
        info!("[Client] 🛑 已拆除 {} 的视图", self.identity.id);
    }
}

struct Listeners {
    notification: Arc<dyn NotificationListener>,
    friend: Arc<dyn FriendListener>,
    conversation: Arc<dyn ConversationListener>,
    feed: Arc<dyn FeedListener>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            notification: Arc::new(EmptyNotificationListener),
            friend: Arc::new(EmptyFriendListener),
            conversation: Arc::new(EmptyConversationListener),
            feed: Arc::new(EmptyFeedListener),
        }
    }
}

pub struct SocialClient {
    config: ClientConfig,
    backend: Backend,
    session: Arc<SessionStore>,
    listeners: Listeners,
    active: Mutex<Option<ActiveSession>>,
}

impl SocialClient {
    pub fn new(config: ClientConfig, backend: Backend) -> Self {
        let session = Arc::new(SessionStore::with_listener(
            &backend,
            &config,
            Arc::new(EmptySessionListener),
        ));
        Self {
            config,
            backend,
            session,
            listeners: Listeners::default(),
            active: Mutex::new(None),
        }
    }

    /// 连接托管后端
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let backend = Backend::remote(&config).context("初始化托管后端失败")?;
        Ok(Self::new(config, backend))
    }

    /// 注册会话监听器（会重建会话存储，应在登录前调用）
    pub fn set_session_listener(&mut self, listener: Arc<dyn SessionListener>) {
        self.session = Arc::new(SessionStore::with_listener(
            &self.backend,
            &self.config,
            listener,
        ));
    }

    /// 以下监听器在下一次登录时生效
    pub fn set_notification_listener(&mut self, listener: Arc<dyn NotificationListener>) {
        self.listeners.notification = listener;
    }

    pub fn set_friend_listener(&mut self, listener: Arc<dyn FriendListener>) {
        self.listeners.friend = listener;
    }

    pub fn set_conversation_listener(&mut self, listener: Arc<dyn ConversationListener>) {
        self.listeners.conversation = listener;
    }

    pub fn set_feed_listener(&mut self, listener: Arc<dyn FeedListener>) {
        self.listeners.feed = listener;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> Arc<SessionStore> {
        self.session.clone()
    }

    pub fn active(&self) -> Option<ActiveSession> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 恢复已保存的会话；没有会话时返回 `None`
    pub async fn restore(&self) -> Result<Option<ActiveSession>> {
        match self.session.restore().await? {
            Some(identity) => Ok(Some(self.activate(identity).await)),
            None => {
                self.teardown();
                Ok(None)
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<ActiveSession> {
        let identity = self.session.login(email, password).await?;
        Ok(self.activate(identity).await)
    }

    pub async fn sign_in_with_handle(&self, handle: &str, password: &str) -> Result<ActiveSession> {
        let identity = self.session.login_with_handle(handle, password).await?;
        Ok(self.activate(identity).await)
    }

    pub async fn register(&self, registration: Registration) -> Result<ActiveSession> {
        let identity = self.session.register(registration).await?;
        Ok(self.activate(identity).await)
    }

    /// 拆除视图并登出
    pub async fn sign_out(&self) -> Result<()> {
        self.teardown();
        self.session.logout().await
    }

    /// 未登录时浏览社区动态
    pub async fn public_feed(&self) -> Result<Arc<FeedView>> {
        let feed = Arc::new(FeedView::with_listener(
            &self.backend,
            None,
            self.listeners.feed.clone(),
        ));
        feed.refresh().await?;
        Ok(feed)
    }

    fn teardown(&self) {
        let previous = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = previous {
            active.shutdown();
        }
    }

    /// 为 `identity` 组装视图模型并启动订阅；拉取或订阅失败只记录日志
    async fn activate(&self, identity: Identity) -> ActiveSession {
        self.teardown();
        info!("[Client] 🚀 激活会话: {} ({})", identity.handle, identity.id);

        let notifications = Arc::new(NotificationCenter::with_listener(
            &self.backend,
            &self.config,
            &identity.id,
            self.listeners.notification.clone(),
        ));
        let friends = Arc::new(FriendService::with_listener(
            &self.backend,
            &self.config,
            identity.clone(),
            self.listeners.friend.clone(),
        ));
        let conversation = Arc::new(ConversationView::with_listener(
            &self.backend,
            identity.clone(),
            notifications.clone(),
            friends.clone(),
            self.listeners.conversation.clone(),
        ));
        let feed = Arc::new(FeedView::with_listener(
            &self.backend,
            Some(identity.clone()),
            self.listeners.feed.clone(),
        ));

        if let Err(e) = notifications.start().await {
            error!("[Client] ❌ 启动通知中心失败: {:#}", e);
        }
        if let Err(e) = friends.start(notifications.trigger()).await {
            error!("[Client] ❌ 启动好友服务失败: {:#}", e);
        }
        if let Err(e) = feed.refresh().await {
            error!("[Client] ❌ 拉取社区动态失败: {:#}", e);
        }

        let active = ActiveSession {
            identity,
            notifications,
            friends,
            conversation,
            feed,
        };
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(active.clone());
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::memory::MemoryBackend;
    use crate::social::testing::init_test_logger;

    fn registration(handle: &str) -> Registration {
        Registration {
            email: format!("{}@space.io", handle),
            password: "orbit42".into(),
            name: handle.to_uppercase(),
            handle: handle.into(),
            bio: "Exploradora".into(),
            avatar: "https://cdn/a.png".into(),
            role: String::new(),
        }
    }

    #[tokio::test]
    async fn test_sign_in_and_out_manage_subscriptions() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let client = SocialClient::new(ClientConfig::local(), memory.backend());
        assert!(client.restore().await.unwrap().is_none());

        let active = client.register(registration("nova")).await.unwrap();
        assert_eq!(active.identity.handle, "@nova");
        // notifications:{me} + friendship:{me}
        assert_eq!(memory.subscriber_count(), 2);

        client.sign_out().await.unwrap();
        assert!(client.active().is_none());
        assert!(client.session().current().is_none());
        assert_eq!(memory.subscriber_count(), 0);

        let again = client.sign_in_with_handle("nova", "orbit42").await.unwrap();
        assert_eq!(again.identity.id, active.identity.id);
        assert_eq!(memory.subscriber_count(), 2);
        client.sign_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_reuses_session() {
        let memory = MemoryBackend::new();
        let client = SocialClient::new(ClientConfig::local(), memory.backend());
        client.register(registration("luna")).await.unwrap();

        let restored = client.restore().await.unwrap().unwrap();
        assert_eq!(restored.identity.handle, "@luna");
        // 恢复时旧视图先被拆除
        assert_eq!(memory.subscriber_count(), 2);

        let feed = client.public_feed().await.unwrap();
        assert!(feed.display_posts().is_empty());
    }
}
