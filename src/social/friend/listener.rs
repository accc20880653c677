//! 好友监听器回调接口

use crate::social::friend::models::{Friend, PendingRequest};
use async_trait::async_trait;

#[async_trait]
pub trait FriendListener: Send + Sync {
    /// 好友列表（含未读数）重新拉取后的结果
    async fn on_friend_list_changed(&self, friends: Vec<Friend>);

    /// 收到的待处理申请列表重新拉取后的结果
    async fn on_friend_request_list_changed(&self, requests: Vec<PendingRequest>);

    /// 当前选中的聊天对象已不再是好友
    async fn on_selected_peer_removed(&self, peer_id: String);
}

/// 默认空实现（无操作）
pub struct EmptyFriendListener;

#[async_trait]
impl FriendListener for EmptyFriendListener {
    async fn on_friend_list_changed(&self, _friends: Vec<Friend>) {
        // 默认不做任何处理
    }

    async fn on_friend_request_list_changed(&self, _requests: Vec<PendingRequest>) {
        // 默认不做任何处理
    }

    async fn on_selected_peer_removed(&self, _peer_id: String) {
        // 默认不做任何处理
    }
}
