//! 会话监听器回调接口

use crate::social::conversation::models::Message;
use async_trait::async_trait;

#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 当前会话的完整消息列表（升序）
    async fn on_messages_changed(&self, peer_id: String, messages: Vec<Message>);

    /// 当前会话收到一条新私信
    async fn on_new_message(&self, message: Message);
}

/// 默认空实现（无操作）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_messages_changed(&self, _peer_id: String, _messages: Vec<Message>) {
        // 默认不做任何处理
    }

    async fn on_new_message(&self, _message: Message) {
        // 默认不做任何处理
    }
}
