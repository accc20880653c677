//! 关系型数据存储接缝
//!
//! 所有业务模块都只通过 `DataStore` 读写数据表，远端实现为 `RestStore`（PostgREST），
//! 测试与演示使用 `MemoryBackend`。

pub mod query;
pub mod rest;

pub use query::{Filter, Order, Query};
pub use rest::RestStore;

use crate::social::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 数据表名
pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const FRIEND_REQUESTS: &str = "friend_requests";
    pub const MESSAGES: &str = "messages";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const POSTS: &str = "posts";
    pub const COMMENTS: &str = "comments";
    pub const POST_LIKES: &str = "post_likes";
    pub const FOLLOWS: &str = "follows";
}

/// 服务端函数名
pub mod rpc {
    pub const INCREMENT_LIKES: &str = "increment_likes";
    pub const DECREMENT_LIKES: &str = "decrement_likes";
}

/// 表级 CRUD 与 RPC
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// 插入一行，返回写入后的完整行
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError>;

    /// 按 `on_conflict` 列插入或合并
    async fn upsert(&self, table: &str, row: Value, on_conflict: &[&str])
        -> Result<Value, StoreError>;

    /// 更新所有匹配行，返回更新后的行
    async fn update(&self, table: &str, query: &Query, patch: Value)
        -> Result<Vec<Value>, StoreError>;

    /// 删除所有匹配行，返回被删除的行
    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError>;
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(StoreError::from))
        .collect()
}

/// 查询并反序列化为目标类型
pub async fn select_as<T: DeserializeOwned>(
    store: &dyn DataStore,
    table: &str,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    decode_rows(store.select(table, query).await?)
}

/// 查询第一条匹配行
pub async fn select_first<T: DeserializeOwned>(
    store: &dyn DataStore,
    table: &str,
    query: Query,
) -> Result<Option<T>, StoreError> {
    let rows = store.select(table, &query.limit(1)).await?;
    match rows.into_iter().next() {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

pub async fn insert_as<T: DeserializeOwned>(
    store: &dyn DataStore,
    table: &str,
    row: Value,
) -> Result<T, StoreError> {
    Ok(serde_json::from_value(store.insert(table, row).await?)?)
}

pub async fn update_as<T: DeserializeOwned>(
    store: &dyn DataStore,
    table: &str,
    query: &Query,
    patch: Value,
) -> Result<Vec<T>, StoreError> {
    decode_rows(store.update(table, query, patch).await?)
}
