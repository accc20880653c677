//! 鉴权服务接缝
//!
//! `AuthProvider` 抽象了托管后端的账号体系：登录、注册、登出、读取当前会话，
//! 以及会话变化的订阅。远端实现 `GoTrueAuth` 直接调用 `/auth/v1` REST 接口。

use crate::social::config::ClientConfig;
use crate::social::error::StoreError;
use crate::social::serialization::jwt_expiry;
use crate::social::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 账号（鉴权层的用户，不含资料）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// 登录会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// 过期时间（秒级时间戳）
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl AuthSession {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, StoreError>;

    /// 注册账号，`metadata` 写入用户元数据（name / handle / avatar_url / bio）
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<AuthSession, StoreError>;

    async fn sign_out(&self) -> Result<(), StoreError>;

    async fn get_session(&self) -> Result<Option<AuthSession>, StoreError>;

    /// 订阅会话变化（登录、登出、刷新）
    fn on_auth_state_change(&self) -> watch::Receiver<Option<AuthSession>>;
}

/// GoTrue（`/auth/v1`）鉴权实现
pub struct GoTrueAuth {
    client: reqwest::Client,
    auth_url: String,
    session: watch::Sender<Option<AuthSession>>,
}

impl GoTrueAuth {
    pub fn new(config: &ClientConfig) -> Result<Self> {
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

        info!("[Auth] 创建鉴权客户端: {}", config.auth_url());
        Ok(Self {
            client,
            auth_url: config.auth_url(),
            session: watch::Sender::new(None),
        })
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<AuthSession, StoreError> {
        let url = format!("{}/token?grant_type={}", self.auth_url, grant_type);
        debug!("[Auth] 请求令牌: grant_type={}", grant_type);

        let response = self.client.post(&url).json(&body).send().await?;
        let mut session: AuthSession = handle_http_response(response, "获取令牌").await?;
        if session.expires_at.is_none() {
            session.expires_at = jwt_expiry(&session.access_token);
        }
        Ok(session)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, StoreError> {
        info!("[Auth] 🔄 访问令牌已过期，刷新会话");
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}

#[async_trait]
impl AuthProvider for GoTrueAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, StoreError> {
        let session = self
            .token_grant(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        info!("[Auth] ✅ 登录成功: {}", session.user.id);
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<AuthSession, StoreError> {
        let url = format!("{}/signup", self.auth_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": metadata,
            }))
            .send()
            .await?;
        let body: Value = handle_http_response(response, "注册").await?;

        // 开启邮箱确认时只返回用户，没有会话
        if body.get("access_token").is_none() {
            warn!("[Auth] 注册成功但需要邮箱确认: {}", email);
            return Err(StoreError::api(
                200,
                "email_not_confirmed",
                "注册成功，请先完成邮箱确认再登录",
            ));
        }
        let mut session: AuthSession = serde_json::from_value(body)?;
        if session.expires_at.is_none() {
            session.expires_at = jwt_expiry(&session.access_token);
        }
        info!("[Auth] ✅ 注册成功: {}", session.user.id);
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        let current = self.session.send_replace(None);
        let Some(session) = current else {
            return Ok(());
        };
        let url = format!("{}/logout", self.auth_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        // 服务端登出失败不影响本地登出
        if let Err(e) = crate::social::types::read_http_response(response, "登出").await {
            warn!("[Auth] ⚠️ 服务端登出失败（本地会话已清除）: {}", e);
        }
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, StoreError> {
        let current = self.session.borrow().clone();
        let Some(session) = current else {
            return Ok(None);
        };
        if !session.is_expired(chrono::Utc::now().timestamp()) {
            return Ok(Some(session));
        }
        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                self.session.send_replace(Some(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(e) => {
                warn!("[Auth] ⚠️ 刷新会话失败，视为未登录: {}", e);
                self.session.send_replace(None);
                Ok(None)
            }
        }
    }

    fn on_auth_state_change(&self) -> watch::Receiver<Option<AuthSession>> {
        self.session.subscribe()
    }
}
