//! 社区动态视图
//!
//! 点赞由两步组成：写 / 删 `post_likes` 记录，再调用原子计数 RPC。
//! RPC 失败时撤销第一步，本地状态保持不变；重复点赞（唯一约束冲突）视为已点赞。

use crate::social::error::SocialError;
use crate::social::feed::api::FeedApi;
use crate::social::feed::listener::{EmptyFeedListener, FeedListener};
use crate::social::feed::models::{Comment, FeedFilter, LikeOutcome, Post, PostDraft, PostRow};
use crate::social::session::api::ProfileApi;
use crate::social::session::models::Identity;
use crate::social::Backend;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct FeedState {
    posts: Vec<Post>,
    liked: HashSet<String>,
    filter: FeedFilter,
    comments: HashMap<String, Vec<Comment>>,
}

pub struct FeedView {
    user: Option<Identity>,
    api: FeedApi,
    profiles: ProfileApi,
    state: Mutex<FeedState>,
    listener: Arc<dyn FeedListener>,
}

impl FeedView {
    /// `user` 为 `None` 时只读（未登录浏览）
    pub fn new(backend: &Backend, user: Option<Identity>) -> Self {
        Self::with_listener(backend, user, Arc::new(EmptyFeedListener))
    }

    pub fn with_listener(
        backend: &Backend,
        user: Option<Identity>,
        listener: Arc<dyn FeedListener>,
    ) -> Self {
        Self {
            user,
            api: FeedApi::new(backend.store.clone()),
            profiles: ProfileApi::new(backend.store.clone()),
            state: Mutex::new(FeedState::default()),
            listener,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_user(&self) -> Result<&Identity, SocialError> {
        self.user.as_ref().ok_or(SocialError::NotSignedIn)
    }

    pub fn filter(&self) -> FeedFilter {
        self.lock().filter
    }

    /// 按当前排序方式展示的帖子
    pub fn display_posts(&self) -> Vec<Post> {
        let state = self.lock();
        state.filter.apply(&state.posts)
    }

    pub fn post(&self, post_id: &str) -> Option<Post> {
        self.lock().posts.iter().find(|p| p.id == post_id).cloned()
    }

    pub fn is_liked(&self, post_id: &str) -> bool {
        self.lock().liked.contains(post_id)
    }

    pub fn comments(&self, post_id: &str) -> Vec<Comment> {
        self.lock().comments.get(post_id).cloned().unwrap_or_default()
    }

    async fn notify_posts(&self) {
        let posts = self.display_posts();
        self.listener.on_posts_changed(posts).await;
    }

    pub async fn set_filter(&self, filter: FeedFilter) {
        self.lock().filter = filter;
        debug!("[Feed] 切换排序: {:?}", filter);
        self.notify_posts().await;
    }

    pub async fn refresh(&self) -> Result<()> {
        let posts = self.fetch_posts().await;
        let likes = self.fetch_user_likes().await;
        posts?;
        likes?;
        Ok(())
    }

    /// 关联作者资料与评论数
    async fn assemble(&self, rows: Vec<PostRow>) -> Result<Vec<Post>> {
        let mut author_ids: Vec<String> = rows.iter().map(|r| r.author_id.clone()).collect();
        author_ids.sort();
        author_ids.dedup();
        let authors = self.profiles.summaries(&author_ids).await?;
        let post_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let counts = self.api.comment_counts(&post_ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let comments = counts.get(&row.id).copied().unwrap_or(0);
                let author = authors.get(&row.author_id);
                Post::assemble(row, author, comments)
            })
            .collect())
    }

    pub async fn fetch_posts(&self) -> Result<Vec<Post>> {
        let rows = self.api.posts().await?;
        let posts = self.assemble(rows).await?;
        self.lock().posts = posts.clone();
        info!("[Feed] 🔄 帖子列表: {} 条", posts.len());
        self.notify_posts().await;
        Ok(posts)
    }

    /// 当前用户点过赞的帖子；未登录时为空
    pub async fn fetch_user_likes(&self) -> Result<HashSet<String>> {
        let liked = match &self.user {
            Some(user) => self.api.user_likes(&user.id).await?,
            None => HashSet::new(),
        };
        self.lock().liked = liked.clone();
        Ok(liked)
    }

    pub async fn posts_by(&self, author_id: &str) -> Result<Vec<Post>> {
        let rows = self.api.posts_by(author_id).await?;
        self.assemble(rows).await
    }

    /// 本地计数与点赞集合同步更新
    async fn apply_like(&self, post_id: &str, liked: bool, delta: i64) {
        {
            let mut state = self.lock();
            if liked {
                state.liked.insert(post_id.to_string());
            } else {
                state.liked.remove(post_id);
            }
            if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
                post.likes = (post.likes + delta).max(0);
            }
        }
        self.notify_posts().await;
    }

    pub async fn toggle_like(&self, post_id: &str) -> Result<LikeOutcome> {
        if self.is_liked(post_id) {
            self.unlike_post(post_id).await
        } else {
            self.like_post(post_id).await
        }
    }

    pub async fn like_post(&self, post_id: &str) -> Result<LikeOutcome> {
        let user = self.require_user()?;
        match self.api.insert_like(post_id, &user.id).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                info!("[Feed] 帖子 {} 已点过赞，同步本地状态", post_id);
                self.apply_like(post_id, true, 0).await;
                return Ok(LikeOutcome::AlreadyLiked);
            }
            Err(e) => return Err(anyhow::Error::from(e).context("点赞失败")),
        }

        if let Err(e) = self.api.increment_likes(post_id).await {
            warn!("[Feed] ⚠️ 计数失败，撤销点赞记录: {:#}", e);
            if let Err(undo) = self.api.delete_like(post_id, &user.id).await {
                error!("[Feed] ❌ 撤销点赞记录失败: {:#}", undo);
            }
            return Err(e);
        }
        self.apply_like(post_id, true, 1).await;
        debug!("[Feed] ❤️ 点赞 {}", post_id);
        Ok(LikeOutcome::Liked)
    }

    pub async fn unlike_post(&self, post_id: &str) -> Result<LikeOutcome> {
        let user = self.require_user()?;
        let removed = self.api.delete_like(post_id, &user.id).await?;
        if removed == 0 {
            info!("[Feed] 帖子 {} 没有点赞记录，同步本地状态", post_id);
            self.apply_like(post_id, false, 0).await;
            return Ok(LikeOutcome::Unliked);
        }

        if let Err(e) = self.api.decrement_likes(post_id).await {
            warn!("[Feed] ⚠️ 计数失败，恢复点赞记录: {:#}", e);
            if let Err(undo) = self.api.insert_like(post_id, &user.id).await {
                error!("[Feed] ❌ 恢复点赞记录失败: {}", undo);
            }
            return Err(e);
        }
        self.apply_like(post_id, false, -1).await;
        debug!("[Feed] 取消点赞 {}", post_id);
        Ok(LikeOutcome::Unliked)
    }

    /// 发布帖子；成功后重新拉取并切换到按时间排序
    pub async fn publish(&self, draft: PostDraft) -> Result<Post> {
        let user = self.require_user()?;
        if draft.content.trim().is_empty() && draft.media_url.is_none() {
            return Err(SocialError::Validation("帖子内容不能为空".to_string()).into());
        }
        let row = self.api.create_post(&user.id, &draft).await?;
        info!("[Feed] ✅ 发布帖子: {}", row.id);
        let post_id = row.id.clone();

        self.lock().filter = FeedFilter::Recent;
        if let Err(e) = self.fetch_posts().await {
            error!("[Feed] ❌ 发布后刷新失败: {:#}", e);
        }
        match self.post(&post_id) {
            Some(post) => Ok(post),
            None => Ok(Post::assemble(row, Some(&user.summary()), 0)),
        }
    }

    pub async fn fetch_comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        let rows = self.api.fetch_comments(post_id).await?;
        let mut author_ids: Vec<String> = rows.iter().map(|r| r.author_id.clone()).collect();
        author_ids.sort();
        author_ids.dedup();
        let authors = self.profiles.summaries(&author_ids).await?;
        let comments: Vec<Comment> = rows
            .into_iter()
            .map(|row| {
                let author = authors.get(&row.author_id);
                Comment::assemble(row, author)
            })
            .collect();

        {
            let mut state = self.lock();
            if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
                post.comments = comments.len();
            }
            state.comments.insert(post_id.to_string(), comments.clone());
        }
        self.listener
            .on_comments_changed(post_id.to_string(), comments.clone())
            .await;
        Ok(comments)
    }

    pub async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment> {
        let user = self.require_user()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(SocialError::Validation("评论内容不能为空".to_string()).into());
        }
        let row = self.api.add_comment(post_id, &user.id, content).await?;
        let comment_id = row.id.clone();
        let comments = self.fetch_comments(post_id).await?;
        self.notify_posts().await;
        Ok(comments
            .into_iter()
            .find(|c| c.id == comment_id)
            .unwrap_or_else(|| Comment::assemble(row, Some(&user.summary()))))
    }
}
