//! PostgREST 数据存储实现（`/rest/v1`）

use crate::social::config::ClientConfig;
use crate::social::error::StoreError;
use crate::social::session::auth::AuthSession;
use crate::social::store::{DataStore, Query};
use crate::social::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

const PREFER_REPRESENTATION: &str = "return=representation";
const PREFER_MERGE: &str = "resolution=merge-duplicates,return=representation";

/// 基于 PostgREST 的表存储
///
/// 请求以当前会话的访问令牌作为 Bearer；未登录时退回匿名密钥
pub struct RestStore {
    client: reqwest::Client,
    rest_url: String,
    anon_key: String,
    schema: String,
    session: watch::Receiver<Option<AuthSession>>,
}

impl RestStore {
    pub fn new(
        config: &ClientConfig,
        session: watch::Receiver<Option<AuthSession>>,
    ) -> Result<Self> {
        // apikey 通过 default_headers 自动添加
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("apikey"),
                    reqwest::header::HeaderValue::from_str(&config.anon_key)
                        .context("无效的 anon key")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            rest_url: config.rest_url(),
            anon_key: config.anon_key.clone(),
            schema: config.schema.clone(),
            session,
        })
    }

    fn bearer(&self) -> String {
        self.session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}/{}", self.rest_url, path);
        debug!("[Store] {} {} 操作ID: {}", method, url, operation_id);

        let profile_header = if method == Method::GET {
            "Accept-Profile"
        } else {
            "Content-Profile"
        };
        self.client
            .request(method, url)
            .bearer_auth(self.bearer())
            .header(profile_header, &self.schema)
            .header("X-Client-Info", "space-community-sdk")
            .header("operationID", operation_id)
    }
}

#[async_trait]
impl DataStore for RestStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let response = self
            .request(Method::GET, table)
            .query(&query.to_params())
            .send()
            .await?;
        handle_http_response(response, &format!("查询 {} ", table)).await
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&row)
            .send()
            .await?;
        let rows: Vec<Value> = handle_http_response(response, &format!("插入 {} ", table)).await?;
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    async fn upsert(
        &self,
        table: &str,
        row: Value,
        on_conflict: &[&str],
    ) -> Result<Value, StoreError> {
        let response = self
            .request(Method::POST, table)
            .query(&[("on_conflict", on_conflict.join(","))])
            .header("Prefer", PREFER_MERGE)
            .json(&row)
            .send()
            .await?;
        let rows: Vec<Value> = handle_http_response(response, &format!("写入 {} ", table)).await?;
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    async fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        let response = self
            .request(Method::PATCH, table)
            .query(&query.to_params())
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&patch)
            .send()
            .await?;
        handle_http_response(response, &format!("更新 {} ", table)).await
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let response = self
            .request(Method::DELETE, table)
            .query(&query.to_params())
            .header("Prefer", PREFER_REPRESENTATION)
            .send()
            .await?;
        handle_http_response(response, &format!("删除 {} ", table)).await
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        let response = self
            .request(Method::POST, &format!("rpc/{}", function))
            .json(&args)
            .send()
            .await?;
        handle_http_response(response, &format!("调用 {} ", function)).await
    }
}
