//! 社区动态监听器回调接口

use crate::social::feed::models::{Comment, Post};
use async_trait::async_trait;

#[async_trait]
pub trait FeedListener: Send + Sync {
    /// 按当前排序方式展示的帖子列表
    async fn on_posts_changed(&self, posts: Vec<Post>);

    async fn on_comments_changed(&self, post_id: String, comments: Vec<Comment>);
}

/// 默认空实现（无操作）
pub struct EmptyFeedListener;

#[async_trait]
impl FeedListener for EmptyFeedListener {
    async fn on_posts_changed(&self, _posts: Vec<Post>) {
        // 默认不做任何处理
    }

    async fn on_comments_changed(&self, _post_id: String, _comments: Vec<Comment>) {
        // 默认不做任何处理
    }
}
