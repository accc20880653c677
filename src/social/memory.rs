//! 进程内后端
//!
//! 同时实现 `DataStore`、`Changefeed` 与 `AuthProvider`，行为与托管后端对齐：
//! 唯一约束（违反时返回 23505）、两个点赞计数 RPC、写入后向订阅者推送变更。
//! 多个客户端可以共享同一个 `MemoryBackend`，每个客户端拥有独立的登录会话。
//! 另外支持故障注入，用于验证回滚逻辑。

use crate::social::error::{StoreError, UNIQUE_VIOLATION};
use crate::social::realtime::{
    ChangeEvent, ChangeFilter, ChangeKind, Changefeed, RawChange, Subscription, Unsubscribe,
};
use crate::social::session::auth::{AuthProvider, AuthSession, AuthUser};
use crate::social::store::{rpc, tables, DataStore, Query};
use crate::social::Backend;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// 可注入故障的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
    Rpc,
}

struct InjectedFailure {
    op: StoreOp,
    target: String,
}

struct MemoryUser {
    id: String,
    password: String,
    metadata: Value,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    users: HashMap<String, MemoryUser>,
    last_timestamp: Option<DateTime<Utc>>,
    failures: Vec<InjectedFailure>,
}

impl MemoryState {
    /// 严格递增的时间戳，保证同一毫秒内写入的行也有确定顺序
    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn take_failure(&mut self, op: StoreOp, target: &str) -> Result<(), StoreError> {
        if let Some(pos) = self
            .failures
            .iter()
            .position(|f| f.op == op && f.target == target)
        {
            self.failures.remove(pos);
            warn!("[Memory] 💥 注入的故障: {:?} {}", op, target);
            return Err(StoreError::api(500, "XX000", format!("注入的故障: {}", target)));
        }
        Ok(())
    }
}

const PROFILE_KEYS: &[&[&str]] = &[&["handle"]];
const FRIEND_REQUEST_KEYS: &[&[&str]] = &[&["sender_id", "receiver_id"]];
const POST_LIKE_KEYS: &[&[&str]] = &[&["post_id", "user_id"]];
const FOLLOW_KEYS: &[&[&str]] = &[&["follower_id", "following_id"]];

/// 各表的唯一约束（主键 id 之外）
fn unique_keys(table: &str) -> &'static [&'static [&'static str]] {
    match table {
        tables::PROFILES => PROFILE_KEYS,
        tables::FRIEND_REQUESTS => FRIEND_REQUEST_KEYS,
        tables::POST_LIKES => POST_LIKE_KEYS,
        tables::FOLLOWS => FOLLOW_KEYS,
        _ => &[],
    }
}

/// 各表的列默认值
fn column_defaults(table: &str) -> Vec<(&'static str, Value)> {
    match table {
        tables::MESSAGES | tables::NOTIFICATIONS => vec![("is_read", Value::Bool(false))],
        tables::FRIEND_REQUESTS => vec![("status", Value::String("pending".into()))],
        tables::POSTS => vec![("likes_count", Value::from(0))],
        _ => Vec::new(),
    }
}

fn same_key(a: &Value, b: &Value, columns: &[&str]) -> bool {
    columns.iter().all(|column| match (a.get(column), b.get(column)) {
        (Some(x), Some(y)) => !x.is_null() && x == y,
        _ => false,
    })
}

fn unique_violation(table: &str, columns: &[&str]) -> StoreError {
    StoreError::api(
        409,
        UNIQUE_VIOLATION,
        format!(
            "duplicate key value violates unique constraint \"{}_{}_key\"",
            table,
            columns.join("_")
        ),
    )
}

fn as_object(row: Value) -> Result<Map<String, Value>, StoreError> {
    match row {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::api(400, "PGRST102", "请求体必须是 JSON 对象")),
    }
}

/// 订阅者登记表
#[derive(Default)]
struct MemoryFeed {
    subscribers: Mutex<HashMap<u64, (ChangeFilter, mpsc::UnboundedSender<ChangeEvent>)>>,
    next_id: AtomicU64,
}

impl MemoryFeed {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, (ChangeFilter, mpsc::UnboundedSender<ChangeEvent>)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, raw: RawChange) {
        let subscribers = self.lock();
        let targets: Vec<_> = subscribers
            .values()
            .filter(|(filter, _)| filter.accepts(&raw))
            .map(|(_, tx)| tx.clone())
            .collect();
        drop(subscribers);
        if targets.is_empty() {
            return;
        }

        let table = raw.table.clone();
        match ChangeEvent::try_from(raw) {
            Ok(event) => {
                for tx in targets {
                    let _ = tx.send(event.clone());
                }
            }
            Err(e) => warn!("[Memory] ⚠️ 丢弃无法解析的变更 ({}): {}", table, e),
        }
    }
}

impl Unsubscribe for MemoryFeed {
    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }
}

/// 进程内后端
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    feed: Arc<MemoryFeed>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 为一个客户端创建后端组合（共享数据，独立会话）
    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend {
            auth: Arc::new(MemoryAuth::new(self.clone())),
            store: self.clone(),
            realtime: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 让下一次针对 `target`（表名或函数名）的 `op` 操作失败
    pub fn fail_next(&self, op: StoreOp, target: &str) {
        self.lock().failures.push(InjectedFailure {
            op,
            target: target.to_string(),
        });
    }

    /// 表中所有行（按插入顺序）
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn count(&self, table: &str, query: &Query) -> usize {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).count())
            .unwrap_or(0)
    }

    /// 当前活跃的订阅数
    pub fn subscriber_count(&self) -> usize {
        self.feed.lock().len()
    }

    /// 写入一行并返回（会触发变更推送），用于准备测试数据
    pub fn seed(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let (inserted, raw) = self.insert_row(table, row)?;
        self.feed.publish(raw);
        Ok(inserted)
    }

    fn insert_row(&self, table: &str, row: Value) -> Result<(Value, RawChange), StoreError> {
        let mut row = as_object(row)?;
        let mut state = self.lock();

        if !row.contains_key("id") {
            row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            let now = state.next_timestamp();
            row.insert("created_at".into(), Value::String(now));
        }
        if table == tables::FRIEND_REQUESTS && !row.contains_key("updated_at") {
            let created = row.get("created_at").cloned().unwrap_or(Value::Null);
            row.insert("updated_at".into(), created);
        }
        for (column, default) in column_defaults(table) {
            if row.get(column).map_or(true, Value::is_null) {
                row.insert(column.to_string(), default);
            }
        }

        let row = Value::Object(row);
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|existing| same_key(existing, &row, &["id"])) {
            return Err(unique_violation(table, &["pkey"]));
        }
        for columns in unique_keys(table) {
            if rows.iter().any(|existing| same_key(existing, &row, columns)) {
                return Err(unique_violation(table, columns));
            }
        }
        rows.push(row.clone());
        debug!("[Memory] 插入 {}: {}", table, row);

        let raw = RawChange::new(table, ChangeKind::Insert, row.clone(), Value::Null);
        Ok((row, raw))
    }

    /// 合并补丁；返回更新后的行与变更
    fn patch_rows(
        &self,
        table: &str,
        query: &Query,
        patch: &Map<String, Value>,
    ) -> Result<Vec<(Value, RawChange)>, StoreError> {
        let mut state = self.lock();
        let now = state.next_timestamp();
        let rows = state.tables.entry(table.to_string()).or_default();

        let matching: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| query.matches(row))
            .map(|(i, _)| i)
            .collect();

        // 先在副本上合并，检查唯一约束后再落盘
        let mut updated = Vec::with_capacity(matching.len());
        for &i in &matching {
            let old = rows[i].clone();
            let mut new = old.clone();
            if let Value::Object(map) = &mut new {
                for (key, value) in patch {
                    map.insert(key.clone(), value.clone());
                }
                if map.contains_key("updated_at") && !patch.contains_key("updated_at") {
                    map.insert("updated_at".into(), Value::String(now.clone()));
                }
            }
            for columns in unique_keys(table) {
                let clash = rows
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && same_key(other, &new, columns));
                if clash {
                    return Err(unique_violation(table, columns));
                }
            }
            updated.push((i, old, new));
        }

        let mut result = Vec::with_capacity(updated.len());
        for (i, old, new) in updated {
            rows[i] = new.clone();
            let raw = RawChange::new(table, ChangeKind::Update, new.clone(), old);
            result.push((new, raw));
        }
        Ok(result)
    }

    fn adjust_likes(&self, args: &Value, delta: i64) -> Result<Vec<RawChange>, StoreError> {
        let post_id = args
            .get("post_id")
            .cloned()
            .ok_or_else(|| StoreError::api(400, "PGRST202", "缺少参数 post_id"))?;
        let mut state = self.lock();
        let rows = state.tables.entry(tables::POSTS.to_string()).or_default();
        let mut changes = Vec::new();
        for row in rows.iter_mut() {
            if row.get("id") != Some(&post_id) {
                continue;
            }
            let old = row.clone();
            let current = row.get("likes_count").and_then(Value::as_i64).unwrap_or(0);
            if let Value::Object(map) = row {
                map.insert("likes_count".into(), Value::from((current + delta).max(0)));
            }
            changes.push(RawChange::new(tables::POSTS, ChangeKind::Update, row.clone(), old));
        }
        Ok(changes)
    }

    fn register_user(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<AuthUser, StoreError> {
        let mut state = self.lock();
        let key = email.trim().to_lowercase();
        if state.users.contains_key(&key) {
            return Err(StoreError::api(422, "user_already_exists", "User already registered"));
        }
        let id = Uuid::new_v4().to_string();
        state.users.insert(
            key.clone(),
            MemoryUser {
                id: id.clone(),
                password: password.to_string(),
                metadata,
            },
        );
        Ok(AuthUser { id, email: key })
    }

    fn verify_user(&self, email: &str, password: &str) -> Result<AuthUser, StoreError> {
        let state = self.lock();
        let key = email.trim().to_lowercase();
        match state.users.get(&key) {
            Some(user) if user.password == password => Ok(AuthUser {
                id: user.id.clone(),
                email: key,
            }),
            _ => Err(StoreError::api(400, "invalid_credentials", "Invalid login credentials")),
        }
    }

    /// 注册时写入的账号元数据
    pub fn user_metadata(&self, email: &str) -> Option<Value> {
        self.lock()
            .users
            .get(&email.trim().to_lowercase())
            .map(|u| u.metadata.clone())
    }
}

#[async_trait]
impl DataStore for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let mut state = self.lock();
        state.take_failure(StoreOp::Select, table)?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| query.apply(rows))
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        self.lock().take_failure(StoreOp::Insert, table)?;
        self.seed(table, row)
    }

    async fn upsert(
        &self,
        table: &str,
        row: Value,
        on_conflict: &[&str],
    ) -> Result<Value, StoreError> {
        self.lock().take_failure(StoreOp::Upsert, table)?;
        let patch = as_object(row.clone())?;

        let mut key = Query::new();
        for column in on_conflict {
            let value = patch.get(*column).cloned().unwrap_or(Value::Null);
            key = key.eq(column, value);
        }
        let existing = self.count(table, &key) > 0;
        if !existing {
            return self.seed(table, row);
        }

        let changes = self.patch_rows(table, &key, &patch)?;
        let mut merged = Value::Null;
        for (new, raw) in changes {
            self.feed.publish(raw);
            merged = new;
        }
        Ok(merged)
    }

    async fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        self.lock().take_failure(StoreOp::Update, table)?;
        let patch = as_object(patch)?;
        let changes = self.patch_rows(table, query, &patch)?;
        let mut updated = Vec::with_capacity(changes.len());
        for (new, raw) in changes {
            self.feed.publish(raw);
            updated.push(new);
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let removed = {
            let mut state = self.lock();
            state.take_failure(StoreOp::Delete, table)?;
            let rows = state.tables.entry(table.to_string()).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|row| query.matches(row));
            *rows = kept;
            removed
        };
        for row in &removed {
            self.feed.publish(RawChange::new(
                table,
                ChangeKind::Delete,
                Value::Null,
                row.clone(),
            ));
        }
        Ok(removed)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        self.lock().take_failure(StoreOp::Rpc, function)?;
        let changes = match function {
            rpc::INCREMENT_LIKES => self.adjust_likes(&args, 1)?,
            rpc::DECREMENT_LIKES => self.adjust_likes(&args, -1)?,
            other => {
                return Err(StoreError::api(
                    404,
                    "PGRST202",
                    format!("找不到函数 {}", other),
                ))
            }
        };
        for raw in changes {
            self.feed.publish(raw);
        }
        Ok(Value::Null)
    }
}

#[async_trait]
impl Changefeed for MemoryBackend {
    async fn subscribe(
        &self,
        channel: &str,
        filter: ChangeFilter,
    ) -> Result<Subscription, StoreError> {
        let id = self.feed.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.feed.lock().insert(id, (filter, tx));
        debug!("[Memory] 订阅通道: {} (#{})", channel, id);
        Ok(Subscription::new(id, channel, rx, self.feed.clone()))
    }
}

/// 单个客户端的登录会话
pub struct MemoryAuth {
    backend: Arc<MemoryBackend>,
    session: watch::Sender<Option<AuthSession>>,
}

impl MemoryAuth {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            session: watch::Sender::new(None),
        }
    }

    fn open_session(&self, user: AuthUser) -> AuthSession {
        let session = AuthSession {
            access_token: format!("memory-{}", Uuid::new_v4()),
            refresh_token: Uuid::new_v4().to_string(),
            expires_at: None,
            user,
        };
        self.session.send_replace(Some(session.clone()));
        session
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, StoreError> {
        let user = self.backend.verify_user(email, password)?;
        Ok(self.open_session(user))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<AuthSession, StoreError> {
        let user = self.backend.register_user(email, password, metadata)?;
        Ok(self.open_session(user))
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        self.session.send_replace(None);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, StoreError> {
        Ok(self.session.borrow().clone())
    }

    fn on_auth_state_change(&self) -> watch::Receiver<Option<AuthSession>> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unique_pair_constraint() {
        let backend = MemoryBackend::new();
        backend
            .insert(tables::POST_LIKES, json!({"post_id": "p1", "user_id": "u1"}))
            .await
            .unwrap();
        let err = backend
            .insert(tables::POST_LIKES, json!({"post_id": "p1", "user_id": "u1"}))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        backend
            .insert(tables::POST_LIKES, json!({"post_id": "p1", "user_id": "u2"}))
            .await
            .unwrap();
        assert_eq!(backend.rows(tables::POST_LIKES).len(), 2);
    }

    #[tokio::test]
    async fn test_insert_defaults_and_ordering() {
        let backend = MemoryBackend::new();
        let first = backend
            .insert(tables::MESSAGES, json!({"sender_id": "a", "receiver_id": "b", "content": "1"}))
            .await
            .unwrap();
        let second = backend
            .insert(tables::MESSAGES, json!({"sender_id": "a", "receiver_id": "b", "content": "2"}))
            .await
            .unwrap();
        assert_eq!(first["is_read"], false);
        assert!(first["id"].is_string());
        assert!(first["created_at"].as_str() < second["created_at"].as_str());
    }

    #[tokio::test]
    async fn test_upsert_merges_on_conflict() {
        let backend = MemoryBackend::new();
        let row = backend
            .upsert(
                tables::FRIEND_REQUESTS,
                json!({"sender_id": "a", "receiver_id": "b", "status": "rejected"}),
                &["sender_id", "receiver_id"],
            )
            .await
            .unwrap();
        let merged = backend
            .upsert(
                tables::FRIEND_REQUESTS,
                json!({"sender_id": "a", "receiver_id": "b", "status": "pending"}),
                &["sender_id", "receiver_id"],
            )
            .await
            .unwrap();
        assert_eq!(merged["id"], row["id"]);
        assert_eq!(merged["status"], "pending");
        assert_eq!(backend.rows(tables::FRIEND_REQUESTS).len(), 1);
    }

    #[tokio::test]
    async fn test_like_counter_rpcs() {
        let backend = MemoryBackend::new();
        let post = backend
            .insert(tables::POSTS, json!({"author_id": "u1", "content": "hola"}))
            .await
            .unwrap();
        let args = json!({"post_id": post["id"]});
        backend.rpc(rpc::INCREMENT_LIKES, args.clone()).await.unwrap();
        backend.rpc(rpc::INCREMENT_LIKES, args.clone()).await.unwrap();
        backend.rpc(rpc::DECREMENT_LIKES, args.clone()).await.unwrap();
        assert_eq!(backend.rows(tables::POSTS)[0]["likes_count"], 1);

        backend.rpc(rpc::DECREMENT_LIKES, args.clone()).await.unwrap();
        backend.rpc(rpc::DECREMENT_LIKES, args).await.unwrap();
        assert_eq!(backend.rows(tables::POSTS)[0]["likes_count"], 0);

        assert!(backend.rpc("unknown_fn", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next(StoreOp::Delete, tables::NOTIFICATIONS);
        assert!(backend
            .delete(tables::NOTIFICATIONS, &Query::new().eq("user_id", "u1"))
            .await
            .is_err());
        assert!(backend
            .delete(tables::NOTIFICATIONS, &Query::new().eq("user_id", "u1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_changes_reach_matching_subscribers() {
        let backend = MemoryBackend::new();
        let mut mine = backend
            .subscribe(
                "notifications:u1",
                ChangeFilter::table(tables::NOTIFICATIONS).where_eq("user_id", "u1"),
            )
            .await
            .unwrap();
        let mut inserts = backend
            .subscribe(
                "chat_room:u2",
                ChangeFilter::table(tables::MESSAGES)
                    .on(ChangeKind::Insert)
                    .where_eq("receiver_id", "u1"),
            )
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count(), 2);

        backend
            .insert(
                tables::NOTIFICATIONS,
                json!({"user_id": "u2", "type": "message", "title": "x"}),
            )
            .await
            .unwrap();
        backend
            .insert(
                tables::NOTIFICATIONS,
                json!({"user_id": "u1", "type": "message", "title": "y"}),
            )
            .await
            .unwrap();
        match mine.recv().await {
            Some(ChangeEvent::Notification(change)) => assert_eq!(change.row().title, "y"),
            other => panic!("unexpected event: {other:?}"),
        }

        let message = backend
            .insert(tables::MESSAGES, json!({"sender_id": "u2", "receiver_id": "u1", "content": "hola"}))
            .await
            .unwrap();
        backend
            .update(tables::MESSAGES, &Query::new().eq("id", message["id"].clone()), json!({"is_read": true}))
            .await
            .unwrap();
        match inserts.recv().await {
            Some(ChangeEvent::Message(change)) => assert_eq!(change.kind(), ChangeKind::Insert),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(inserts.try_recv().is_none());

        drop(mine);
        drop(inserts);
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_separate_sessions_share_accounts() {
        let backend = MemoryBackend::new();
        let a = backend.backend();
        let b = backend.backend();
        let session = a
            .auth
            .sign_up("nova@space.io", "orbit42", json!({"handle": "@nova"}))
            .await
            .unwrap();
        assert!(b.auth.get_session().await.unwrap().is_none());

        let again = b.auth.sign_in("NOVA@space.io", "orbit42").await.unwrap();
        assert_eq!(again.user.id, session.user.id);
        assert!(b.auth.sign_in("nova@space.io", "wrong").await.is_err());
        assert!(a
            .auth
            .sign_up("nova@space.io", "orbit42", Value::Null)
            .await
            .is_err());
        assert_eq!(backend.user_metadata("nova@space.io").unwrap()["handle"], "@nova");
    }
}
