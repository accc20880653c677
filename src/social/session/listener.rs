//! 会话监听器回调接口

use crate::social::session::models::Identity;
use async_trait::async_trait;

#[async_trait]
pub trait SessionListener: Send + Sync {
    /// 当前身份发生变化（登录、资料更新为 `Some`，登出为 `None`）
    async fn on_identity_changed(&self, identity: Option<Identity>);
}

/// 默认空实现（无操作）
pub struct EmptySessionListener;

#[async_trait]
impl SessionListener for EmptySessionListener {
    async fn on_identity_changed(&self, _identity: Option<Identity>) {
        // 默认不做任何处理
    }
}
