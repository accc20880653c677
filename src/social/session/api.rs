//! `profiles` 表访问

use crate::social::session::models::{Identity, ProfileRow, ProfileSummary};
use crate::social::store::{select_as, select_first, tables, DataStore, Query};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 资料读写
#[derive(Clone)]
pub struct ProfileApi {
    store: Arc<dyn DataStore>,
}

impl ProfileApi {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        Ok(select_first(
            self.store.as_ref(),
            tables::PROFILES,
            Query::new().eq("id", user_id),
        )
        .await?)
    }

    /// 通过 handle 查找（handle 需已规范化）
    pub async fn find_by_handle(&self, handle: &str) -> Result<Option<ProfileRow>> {
        select_first(
            self.store.as_ref(),
            tables::PROFILES,
            Query::new().eq("handle", handle),
        )
        .await
        .context("按用户名查找资料失败")
    }

    /// 批量读取公开资料，返回 id → 资料
    pub async fn summaries(&self, ids: &[String]) -> Result<HashMap<String, ProfileSummary>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<ProfileRow> = select_as(
            self.store.as_ref(),
            tables::PROFILES,
            &Query::new().is_in("id", ids.iter().cloned()),
        )
        .await
        .context("批量读取资料失败")?;
        debug!("[ProfileAPI] 读取资料 {} / {}", rows.len(), ids.len());
        Ok(rows
            .into_iter()
            .map(|row| (row.id.clone(), ProfileSummary::from(row)))
            .collect())
    }

    /// handle 模糊搜索（ILIKE %q%）
    pub async fn search(&self, pattern: &str, limit: usize) -> Result<Vec<ProfileSummary>> {
        let rows: Vec<ProfileRow> = select_as(
            self.store.as_ref(),
            tables::PROFILES,
            &Query::new()
                .ilike("handle", format!("%{}%", pattern))
                .limit(limit),
        )
        .await
        .context("搜索用户失败")?;
        Ok(rows.into_iter().map(ProfileSummary::from).collect())
    }

    /// 注册后写入资料行（按 id 合并）
    pub async fn upsert(&self, identity: &Identity) -> Result<()> {
        self.store
            .upsert(
                tables::PROFILES,
                serde_json::to_value(identity).context("序列化资料失败")?,
                &["id"],
            )
            .await?;
        Ok(())
    }

    pub async fn update(&self, user_id: &str, patch: Map<String, Value>) -> Result<()> {
        self.store
            .update(
                tables::PROFILES,
                &Query::new().eq("id", user_id),
                Value::Object(patch),
            )
            .await?;
        Ok(())
    }
}
