//! `friend_requests` 与 `follows` 表访问

use crate::social::error::StoreError;
use crate::social::friend::models::{FriendRequest, FriendStatus};
use crate::social::store::{select_as, select_first, tables, update_as, DataStore, Query};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// 好友关系读写（以当前用户为视角）
#[derive(Clone)]
pub struct FriendApi {
    store: Arc<dyn DataStore>,
    user_id: String,
}

impl FriendApi {
    pub fn new(store: Arc<dyn DataStore>, user_id: String) -> Self {
        Self { store, user_id }
    }

    /// 两人之间的关系行（不分方向）
    pub async fn find_between(&self, a: &str, b: &str) -> Result<Option<FriendRequest>> {
        select_first(
            self.store.as_ref(),
            tables::FRIEND_REQUESTS,
            Query::new().pair("sender_id", "receiver_id", a, b),
        )
        .await
        .context("查询好友关系失败")
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<FriendRequest>> {
        select_first(
            self.store.as_ref(),
            tables::FRIEND_REQUESTS,
            Query::new().eq("id", request_id),
        )
        .await
        .context("读取好友申请失败")
    }

    /// 以我为发送方写入待处理申请，按 `(sender_id, receiver_id)` 合并
    pub async fn create_pending(&self, receiver_id: &str) -> Result<FriendRequest, StoreError> {
        let row = self
            .store
            .upsert(
                tables::FRIEND_REQUESTS,
                json!({
                    "sender_id": self.user_id,
                    "receiver_id": receiver_id,
                    "status": FriendStatus::Pending.as_str(),
                }),
                &["sender_id", "receiver_id"],
            )
            .await?;
        Ok(serde_json::from_value(row)?)
    }

    /// 只在申请仍为待处理、且我是接收方时更新状态
    pub async fn answer(&self, request_id: &str, status: FriendStatus) -> Result<Vec<FriendRequest>> {
        update_as(
            self.store.as_ref(),
            tables::FRIEND_REQUESTS,
            &Query::new()
                .eq("id", request_id)
                .eq("receiver_id", self.user_id.as_str())
                .eq("status", FriendStatus::Pending.as_str()),
            json!({ "status": status.as_str() }),
        )
        .await
        .context("更新好友申请状态失败")
    }

    pub async fn delete(&self, request_id: &str) -> Result<usize> {
        let removed = self
            .store
            .delete(tables::FRIEND_REQUESTS, &Query::new().eq("id", request_id))
            .await
            .context("删除好友申请失败")?;
        Ok(removed.len())
    }

    /// 删除我与 `peer_id` 之间指定状态的关系行
    pub async fn delete_between(&self, peer_id: &str, status: FriendStatus) -> Result<usize> {
        let removed = self
            .store
            .delete(
                tables::FRIEND_REQUESTS,
                &Query::new()
                    .pair("sender_id", "receiver_id", &self.user_id, peer_id)
                    .eq("status", status.as_str()),
            )
            .await
            .context("删除好友关系失败")?;
        Ok(removed.len())
    }

    /// `user_id` 的所有已接受关系
    pub async fn accepted_for(&self, user_id: &str) -> Result<Vec<FriendRequest>> {
        let rows: Vec<FriendRequest> = select_as(
            self.store.as_ref(),
            tables::FRIEND_REQUESTS,
            &Query::new()
                .eq("status", FriendStatus::Accepted.as_str())
                .involving(&["sender_id", "receiver_id"], user_id)
                .order("updated_at", false),
        )
        .await
        .context("获取好友列表失败")?;
        debug!("[FriendAPI] {} 的好友关系: {} 条", user_id, rows.len());
        Ok(rows)
    }

    /// 发给我的待处理申请，最新在前
    pub async fn incoming_pending(&self) -> Result<Vec<FriendRequest>> {
        select_as(
            self.store.as_ref(),
            tables::FRIEND_REQUESTS,
            &Query::new()
                .eq("receiver_id", self.user_id.as_str())
                .eq("status", FriendStatus::Pending.as_str())
                .order("created_at", false),
        )
        .await
        .context("获取好友申请列表失败")
    }

    /// 关注；已关注时不报错
    pub async fn follow(&self, target_id: &str) -> Result<()> {
        let result = self
            .store
            .insert(
                tables::FOLLOWS,
                json!({ "follower_id": self.user_id, "following_id": target_id }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_unique_violation() => {
                debug!("[FriendAPI] 已关注 {}", target_id);
                Ok(())
            }
            Err(e) => Err(e).context("关注失败"),
        }
    }

    pub async fn unfollow(&self, target_id: &str) -> Result<()> {
        self.store
            .delete(tables::FOLLOWS, &self.follow_key(target_id))
            .await
            .context("取消关注失败")?;
        Ok(())
    }

    pub async fn is_following(&self, target_id: &str) -> Result<bool> {
        let rows = self
            .store
            .select(tables::FOLLOWS, &self.follow_key(target_id).limit(1))
            .await
            .context("查询关注状态失败")?;
        Ok(!rows.is_empty())
    }

    fn follow_key(&self, target_id: &str) -> Query {
        Query::new()
            .eq("follower_id", self.user_id.as_str())
            .eq("following_id", target_id)
    }
}
