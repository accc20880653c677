//! 好友关系状态机服务层
//!
//! 关系行的生命周期：
//! 无 → pending（发送）→ accepted（接收方同意）→ 删除（任一方解除）
//! pending → 删除（接收方拒绝）。
//! 历史遗留的 rejected 行在重新申请时被删除后重建。
//!
//! 本地只缓存好友列表与收到的申请，任何与我相关的实时事件都会触发整表重新拉取。

use crate::social::config::ClientConfig;
use crate::social::conversation::api::MessageApi;
use crate::social::error::SocialError;
use crate::social::friend::api::FriendApi;
use crate::social::friend::listener::{EmptyFriendListener, FriendListener};
use crate::social::friend::models::{
    Friend, FriendRequest, FriendSnapshot, FriendStatus, PendingRequest, Relationship,
};
use crate::social::notification::api::NotificationApi;
use crate::social::notification::models::NewNotification;
use crate::social::realtime::{AbortOnDrop, Change, ChangeEvent, ChangeFilter, ChannelTask, Changefeed};
use crate::social::session::api::ProfileApi;
use crate::social::session::models::{Identity, ProfileSummary};
use crate::social::store::tables;
use crate::social::Backend;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct FriendService {
    identity: Identity,
    search_min_chars: usize,
    search_limit: usize,
    api: FriendApi,
    profiles: ProfileApi,
    messages: MessageApi,
    notifications: NotificationApi,
    realtime: Arc<dyn Changefeed>,
    state: Mutex<FriendSnapshot>,
    listener: Arc<dyn FriendListener>,
    task: Mutex<Option<ChannelTask>>,
    follower: Mutex<Option<AbortOnDrop>>,
}

impl FriendService {
    /// 创建好友服务（使用默认空监听器）
    pub fn new(backend: &Backend, config: &ClientConfig, identity: Identity) -> Self {
        Self::with_listener(backend, config, identity, Arc::new(EmptyFriendListener))
    }

    /// 创建好友服务（带自定义监听器）
    pub fn with_listener(
        backend: &Backend,
        config: &ClientConfig,
        identity: Identity,
        listener: Arc<dyn FriendListener>,
    ) -> Self {
        info!("[Friend] 创建好友服务，用户ID: {}", identity.id);
        Self {
            search_min_chars: config.search_min_chars,
            search_limit: config.search_limit,
            api: FriendApi::new(backend.store.clone(), identity.id.clone()),
            profiles: ProfileApi::new(backend.store.clone()),
            messages: MessageApi::new(backend.store.clone(), identity.id.clone()),
            notifications: NotificationApi::new(backend.store.clone(), identity.id.clone()),
            realtime: backend.realtime.clone(),
            state: Mutex::new(FriendSnapshot::default()),
            listener,
            task: Mutex::new(None),
            follower: Mutex::new(None),
            identity,
        }
    }

    fn me(&self) -> &str {
        &self.identity.id
    }

    fn lock(&self) -> MutexGuard<'_, FriendSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 拉取列表，订阅 `friendship:{me}`，并在通知对账后刷新未读徽标
    pub async fn start(self: &Arc<Self>, mut trigger: watch::Receiver<u64>) -> Result<()> {
        info!("[Friend] 🚀 启动好友服务: {}", self.me());
        if let Err(e) = self.refresh().await {
            error!("[Friend] ❌ 首次拉取好友数据失败: {:#}", e);
        }

        let channel = format!("friendship:{}", self.me());
        match self
            .realtime
            .subscribe(&channel, ChangeFilter::table(tables::FRIEND_REQUESTS))
            .await
        {
            Ok(subscription) => {
                let service = Arc::downgrade(self);
                let task = ChannelTask::spawn(subscription, move |event| {
                    let service = service.clone();
                    async move {
                        match Weak::upgrade(&service) {
                            Some(service) => {
                                service.handle_event(event).await;
                                true
                            }
                            None => false,
                        }
                    }
                });
                *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
                info!("[Friend] ✅ 已订阅通道: {}", channel);
            }
            Err(e) => warn!("[Friend] ⚠️ 订阅 {} 失败，仅在打开时刷新: {}", channel, e),
        }

        let service = Arc::downgrade(self);
        let follower = tokio::spawn(async move {
            while trigger.changed().await.is_ok() {
                let Some(service) = Weak::upgrade(&service) else {
                    break;
                };
                debug!("[Friend] 🔔 通知已对账，刷新未读徽标");
                if let Err(e) = service.fetch_friends().await {
                    error!("[Friend] ❌ 刷新好友未读数失败: {:#}", e);
                }
            }
        });
        *self.follower.lock().unwrap_or_else(|e| e.into_inner()) = Some(AbortOnDrop(follower));
        Ok(())
    }

    /// 取消订阅并停止后台任务
    pub fn stop(&self) {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.follower.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!("[Friend] 🛑 停止好友服务: {}", self.me());
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let ChangeEvent::FriendRequest(change) = event else {
            return;
        };
        if !change.rows().iter().any(|row| row.involves(self.me())) {
            return;
        }
        debug!(
            "[Friend] 📨 好友关系变更: {:?} {}",
            change.kind(),
            change.row().id
        );

        if let Change::Delete(row) = &change {
            if let Some(peer) = row.peer_of(self.me()) {
                self.deselect_if(peer).await;
            }
        }
        if let Err(e) = self.refresh().await {
            error!("[Friend] ❌ 事件后刷新失败: {:#}", e);
        }
    }

    /// 若 `peer_id` 为当前选中对象则取消选中并通知监听器
    async fn deselect_if(&self, peer_id: &str) {
        let removed = {
            let mut state = self.lock();
            if state.selected_peer.as_deref() == Some(peer_id) {
                state.selected_peer = None;
                true
            } else {
                false
            }
        };
        if removed {
            info!("[Friend] 选中的聊天对象 {} 已解除好友关系", peer_id);
            self.listener.on_selected_peer_removed(peer_id.to_string()).await;
        }
    }

    pub fn snapshot(&self) -> FriendSnapshot {
        self.lock().clone()
    }

    pub fn friends(&self) -> Vec<Friend> {
        self.lock().friends.clone()
    }

    pub fn requests(&self) -> Vec<PendingRequest> {
        self.lock().requests.clone()
    }

    pub fn selected_peer(&self) -> Option<String> {
        self.lock().selected_peer.clone()
    }

    /// 拉取好友列表与收到的申请；任一失败时保留对应的旧列表
    pub async fn refresh(&self) -> Result<()> {
        let friends = self.fetch_friends().await;
        let requests = self.fetch_requests().await;
        friends?;
        requests?;
        Ok(())
    }

    /// 已接受的好友及各自发给我的未读私信数（当前选中的对象记为 0）
    pub async fn fetch_friends(&self) -> Result<Vec<Friend>> {
        let rows = self.api.accepted_for(self.me()).await?;
        let peer_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.peer_of(self.me()).map(str::to_string))
            .collect();
        let profiles = self.profiles.summaries(&peer_ids).await?;
        let unread = self.messages.unread_counts().await?;

        let friends = {
            let mut state = self.lock();
            let selected = state.selected_peer.clone();
            let friends: Vec<Friend> = peer_ids
                .iter()
                .map(|id| {
                    let profile = profiles
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| ProfileSummary::unknown(id));
                    let count = if selected.as_deref() == Some(id.as_str()) {
                        0
                    } else {
                        unread.get(id).copied().unwrap_or(0)
                    };
                    Friend::from_profile(profile, count)
                })
                .collect();
            state.friends = friends.clone();
            friends
        };
        debug!("[Friend] 🔄 好友列表: {} 人", friends.len());
        self.listener.on_friend_list_changed(friends.clone()).await;
        Ok(friends)
    }

    /// 发给我的待处理申请（附带发送方资料）
    pub async fn fetch_requests(&self) -> Result<Vec<PendingRequest>> {
        let rows = self.api.incoming_pending().await?;
        let sender_ids: Vec<String> = rows.iter().map(|r| r.sender_id.clone()).collect();
        let profiles = self.profiles.summaries(&sender_ids).await?;
        let requests: Vec<PendingRequest> = rows
            .into_iter()
            .map(|request| {
                let sender = profiles
                    .get(&request.sender_id)
                    .cloned()
                    .unwrap_or_else(|| ProfileSummary::unknown(&request.sender_id));
                PendingRequest { request, sender }
            })
            .collect();
        self.lock().requests = requests.clone();
        debug!("[Friend] 🔄 待处理申请: {} 条", requests.len());
        self.listener
            .on_friend_request_list_changed(requests.clone())
            .await;
        Ok(requests)
    }

    /// 我与 `peer_id` 的关系
    pub async fn relationship_with(&self, peer_id: &str) -> Result<Relationship> {
        Ok(self
            .api
            .find_between(self.me(), peer_id)
            .await?
            .map(|row| row.relationship_for(self.me()))
            .unwrap_or(Relationship::None))
    }

    /// 发送好友申请
    ///
    /// 已有 pending / accepted 关系时返回 `Conflict`；
    /// 遗留的 rejected 行先删除再重新申请。
    pub async fn send_request(&self, target_id: &str) -> Result<FriendRequest> {
        if target_id == self.me() {
            return Err(SocialError::Validation("不能向自己发送好友申请".to_string()).into());
        }

        if let Some(existing) = self.api.find_between(self.me(), target_id).await? {
            match existing.status {
                FriendStatus::Pending | FriendStatus::Accepted => {
                    info!(
                        "[Friend] 与 {} 已存在关系 ({})",
                        target_id,
                        existing.status.as_str()
                    );
                    return Err(SocialError::Conflict.into());
                }
                FriendStatus::Rejected => {
                    info!("[Friend] 清理与 {} 的旧 rejected 关系: {}", target_id, existing.id);
                    self.api.delete(&existing.id).await?;
                }
            }
        }

        let request = match self.api.create_pending(target_id).await {
            Ok(request) => request,
            Err(e) if e.is_unique_violation() => return Err(SocialError::Conflict.into()),
            Err(e) => return Err(e).context("发送好友申请失败"),
        };
        info!("[Friend] ✅ 已向 {} 发送好友申请: {}", target_id, request.id);

        let notification = NewNotification::friend_request(target_id, &self.identity);
        if let Err(e) = self.notifications.create(notification).await {
            warn!("[Friend] ⚠️ 好友申请通知写入失败（申请已生效）: {:#}", e);
        }
        Ok(request)
    }

    /// 接受申请：只有接收方可以处理待处理的申请
    pub async fn accept_request(&self, request_id: &str) -> Result<FriendRequest> {
        let request = self
            .api
            .get(request_id)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("好友申请 {}", request_id)))?;
        request.ensure_answerable_by(self.me())?;

        let accepted = self
            .api
            .answer(request_id, FriendStatus::Accepted)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SocialError::InvalidState("申请已被处理".to_string()))?;
        info!("[Friend] ✅ 已接受 {} 的好友申请", accepted.sender_id);

        let notification = NewNotification::request_accepted(&accepted.sender_id, &self.identity);
        if let Err(e) = self.notifications.create(notification).await {
            warn!("[Friend] ⚠️ 接受通知写入失败（好友关系已生效）: {:#}", e);
        }
        if let Err(e) = self.refresh().await {
            error!("[Friend] ❌ 接受后刷新失败: {:#}", e);
        }
        Ok(accepted)
    }

    /// 拒绝申请：直接删除关系行
    pub async fn reject_request(&self, request_id: &str) -> Result<()> {
        let request = self
            .api
            .get(request_id)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("好友申请 {}", request_id)))?;
        request.ensure_answerable_by(self.me())?;

        self.api.delete(request_id).await?;
        info!("[Friend] 已拒绝 {} 的好友申请", request.sender_id);
        if let Err(e) = self.fetch_requests().await {
            error!("[Friend] ❌ 拒绝后刷新申请列表失败: {:#}", e);
        }
        Ok(())
    }

    /// 解除好友关系（调用方负责二次确认）
    pub async fn remove_friend(&self, peer_id: &str) -> Result<()> {
        let removed = self.api.delete_between(peer_id, FriendStatus::Accepted).await?;
        if removed == 0 {
            return Err(SocialError::NotFound(format!("与 {} 的好友关系", peer_id)).into());
        }
        info!("[Friend] 已解除与 {} 的好友关系", peer_id);
        self.deselect_if(peer_id).await;
        if let Err(e) = self.fetch_friends().await {
            error!("[Friend] ❌ 解除后刷新好友列表失败: {:#}", e);
        }
        Ok(())
    }

    /// 任意用户的好友列表（公开资料页）
    pub async fn friends_of(&self, user_id: &str) -> Result<Vec<ProfileSummary>> {
        let rows = self.api.accepted_for(user_id).await?;
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.peer_of(user_id).map(str::to_string))
            .collect();
        let profiles = self.profiles.summaries(&ids).await?;
        Ok(ids
            .iter()
            .map(|id| {
                profiles
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| ProfileSummary::unknown(id))
            })
            .collect())
    }

    /// 按 handle 搜索用户（不含自己）；关键字过短时返回空
    pub async fn search_profiles(&self, query: &str) -> Result<Vec<ProfileSummary>> {
        let query = query.trim();
        if query.chars().count() < self.search_min_chars {
            return Ok(Vec::new());
        }
        let mut found = self.profiles.search(query, self.search_limit + 1).await?;
        found.retain(|p| p.id != self.me());
        found.truncate(self.search_limit);
        Ok(found)
    }

    /// 在已加载的好友中按名字或 handle 过滤
    pub fn filter_friends(&self, query: &str) -> Vec<Friend> {
        self.lock()
            .friends
            .iter()
            .filter(|f| f.matches(query))
            .cloned()
            .collect()
    }

    pub async fn follow(&self, target_id: &str) -> Result<()> {
        if target_id == self.me() {
            return Err(SocialError::Validation("不能关注自己".to_string()).into());
        }
        self.api.follow(target_id).await?;
        info!("[Friend] 已关注 {}", target_id);
        Ok(())
    }

    /// 取消关注；后端可能同时解除好友关系，因此随后刷新好友列表
    pub async fn unfollow(&self, target_id: &str) -> Result<()> {
        self.api.unfollow(target_id).await?;
        info!("[Friend] 已取消关注 {}", target_id);
        if let Err(e) = self.fetch_friends().await {
            error!("[Friend] ❌ 取消关注后刷新失败: {:#}", e);
        }
        Ok(())
    }

    pub async fn is_following(&self, target_id: &str) -> Result<bool> {
        self.api.is_following(target_id).await
    }

    /// 选中聊天对象，其未读徽标立即清零
    pub async fn select_peer(&self, peer_id: &str) {
        self.lock().selected_peer = Some(peer_id.to_string());
        self.clear_unread(peer_id).await;
    }

    pub fn deselect(&self) {
        let previous = self.lock().selected_peer.take();
        if let Some(peer) = previous {
            debug!("[Friend] 取消选中 {}", peer);
        }
    }

    /// 清零某个好友的未读徽标
    pub async fn clear_unread(&self, peer_id: &str) {
        let friends = {
            let mut state = self.lock();
            let Some(friend) = state.friends.iter_mut().find(|f| f.id == peer_id) else {
                return;
            };
            if friend.unread_count == 0 {
                return;
            }
            friend.unread_count = 0;
            state.friends.clone()
        };
        self.listener.on_friend_list_changed(friends).await;
    }
}
