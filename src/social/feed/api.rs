//! `posts` / `comments` / `post_likes` 表与点赞计数 RPC

use crate::social::error::StoreError;
use crate::social::feed::models::{CommentRow, PostDraft, PostRow};
use crate::social::store::{insert_as, rpc, select_as, tables, DataStore, Query};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
struct PostIdOnly {
    post_id: String,
}

#[derive(Clone)]
pub struct FeedApi {
    store: Arc<dyn DataStore>,
}

impl FeedApi {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// 全部帖子，最新在前
    pub async fn posts(&self) -> Result<Vec<PostRow>> {
        let rows: Vec<PostRow> = select_as(
            self.store.as_ref(),
            tables::POSTS,
            &Query::new().order("created_at", false),
        )
        .await
        .context("获取帖子列表失败")?;
        debug!("[FeedAPI] 获取帖子 {} 条", rows.len());
        Ok(rows)
    }

    pub async fn posts_by(&self, author_id: &str) -> Result<Vec<PostRow>> {
        select_as(
            self.store.as_ref(),
            tables::POSTS,
            &Query::new()
                .eq("author_id", author_id)
                .order("created_at", false),
        )
        .await
        .context("获取用户帖子失败")
    }

    /// 每个帖子的评论数
    pub async fn comment_counts(&self, post_ids: &[String]) -> Result<HashMap<String, usize>> {
        if post_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<PostIdOnly> = select_as(
            self.store.as_ref(),
            tables::COMMENTS,
            &Query::new()
                .columns("post_id")
                .is_in("post_id", post_ids.iter().cloned()),
        )
        .await
        .context("统计评论数失败")?;
        let mut counts = HashMap::new();
        for row in rows {
            *counts.entry(row.post_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// 用户点过赞的帖子
    pub async fn user_likes(&self, user_id: &str) -> Result<HashSet<String>> {
        let rows: Vec<PostIdOnly> = select_as(
            self.store.as_ref(),
            tables::POST_LIKES,
            &Query::new().columns("post_id").eq("user_id", user_id),
        )
        .await
        .context("获取点赞记录失败")?;
        Ok(rows.into_iter().map(|row| row.post_id).collect())
    }

    /// 写入点赞记录；重复点赞返回唯一约束冲突
    pub async fn insert_like(&self, post_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.store
            .insert(
                tables::POST_LIKES,
                json!({ "post_id": post_id, "user_id": user_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_like(&self, post_id: &str, user_id: &str) -> Result<usize> {
        let removed = self
            .store
            .delete(
                tables::POST_LIKES,
                &Query::new().eq("post_id", post_id).eq("user_id", user_id),
            )
            .await
            .context("删除点赞记录失败")?;
        Ok(removed.len())
    }

    pub async fn increment_likes(&self, post_id: &str) -> Result<()> {
        self.store
            .rpc(rpc::INCREMENT_LIKES, json!({ "post_id": post_id }))
            .await
            .context("点赞计数 +1 失败")?;
        Ok(())
    }

    pub async fn decrement_likes(&self, post_id: &str) -> Result<()> {
        self.store
            .rpc(rpc::DECREMENT_LIKES, json!({ "post_id": post_id }))
            .await
            .context("点赞计数 -1 失败")?;
        Ok(())
    }

    pub async fn create_post(&self, author_id: &str, draft: &PostDraft) -> Result<PostRow> {
        insert_as(
            self.store.as_ref(),
            tables::POSTS,
            json!({
                "author_id": author_id,
                "content": draft.content,
                "media_url": draft.media_url,
                "media_type": draft.media_type,
                "link_url": draft.link_url,
                "likes_count": 0,
            }),
        )
        .await
        .context("发布帖子失败")
    }

    /// 帖子的评论，按时间升序
    pub async fn fetch_comments(&self, post_id: &str) -> Result<Vec<CommentRow>> {
        select_as(
            self.store.as_ref(),
            tables::COMMENTS,
            &Query::new()
                .eq("post_id", post_id)
                .order("created_at", true),
        )
        .await
        .context("获取评论失败")
    }

    pub async fn add_comment(
        &self,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<CommentRow> {
        insert_as(
            self.store.as_ref(),
            tables::COMMENTS,
            json!({ "post_id": post_id, "author_id": author_id, "content": content }),
        )
        .await
        .context("发表评论失败")
    }
}
