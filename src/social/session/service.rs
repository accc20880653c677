//! 会话存储
//!
//! 持有当前登录用户的身份：账号会话 + `profiles` 表中的资料。
//! 资料缺失、读取失败或超时都会退化为占位身份，保证登录流程不被资料问题阻塞。

use crate::social::config::ClientConfig;
use crate::social::error::{store_error, SocialError};
use crate::social::session::api::ProfileApi;
use crate::social::session::auth::{AuthProvider, AuthSession, AuthUser};
use crate::social::session::listener::{EmptySessionListener, SessionListener};
use crate::social::session::models::{
    normalize_handle, Identity, ProfileUpdate, Registration,
};
use crate::social::Backend;
use anyhow::{Context, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct SessionStore {
    auth: Arc<dyn AuthProvider>,
    profiles: ProfileApi,
    profile_timeout: Duration,
    identity: RwLock<Option<Identity>>,
    listener: Arc<dyn SessionListener>,
}

impl SessionStore {
    /// 创建会话存储（使用默认空监听器）
    pub fn new(backend: &Backend, config: &ClientConfig) -> Self {
        Self::with_listener(backend, config, Arc::new(EmptySessionListener))
    }

    /// 创建会话存储（带自定义监听器）
    pub fn with_listener(
        backend: &Backend,
        config: &ClientConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            auth: backend.auth.clone(),
            profiles: ProfileApi::new(backend.store.clone()),
            profile_timeout: config.profile_fetch_timeout,
            identity: RwLock::new(None),
            listener,
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    fn current_id(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|i| i.id.clone())
    }

    async fn set_identity(&self, identity: Option<Identity>) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity.clone();
        self.listener.on_identity_changed(identity).await;
    }

    /// 读取资料；任何失败都退化为占位身份
    async fn load_profile(&self, user: &AuthUser) -> Identity {
        match tokio::time::timeout(self.profile_timeout, self.profiles.get(&user.id)).await {
            Ok(Ok(Some(row))) => {
                info!("[Session] ✅ 资料加载成功: {}", row.handle);
                Identity::from_profile(row, &user.email)
            }
            Ok(Ok(None)) => {
                warn!("[Session] ⚠️ 用户 {} 没有资料行，使用占位身份", user.id);
                Identity::guest(&user.id, &user.email)
            }
            Ok(Err(e)) => {
                error!("[Session] ❌ 资料加载失败，使用占位身份: {:#}", e);
                Identity::guest(&user.id, &user.email)
            }
            Err(_) => {
                warn!(
                    "[Session] ⏱️ 资料加载超过 {:?}，使用占位身份",
                    self.profile_timeout
                );
                Identity::guest(&user.id, &user.email)
            }
        }
    }

    async fn establish(&self, session: &AuthSession) -> Identity {
        let identity = self.load_profile(&session.user).await;
        self.set_identity(Some(identity.clone())).await;
        identity
    }

    /// 恢复已有会话；没有会话时为未登录状态
    pub async fn restore(&self) -> Result<Option<Identity>> {
        let session = match self.auth.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("[Session] ⚠️ 读取会话失败，视为未登录: {}", e);
                None
            }
        };
        match session {
            Some(session) => {
                info!("[Session] 🔄 恢复会话: {}", session.user.id);
                Ok(Some(self.establish(&session).await))
            }
            None => {
                info!("[Session] 没有已保存的会话");
                self.set_identity(None).await;
                Ok(None)
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Identity> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(SocialError::Validation("请输入邮箱和密码".to_string()).into());
        }
        info!("[Session] 🔑 登录: {}", email);
        let session = self
            .auth
            .sign_in(email.trim(), password)
            .await
            .context("登录失败")?;
        Ok(self.establish(&session).await)
    }

    /// 通过 handle 登录：先在资料表中查出邮箱
    pub async fn login_with_handle(&self, handle: &str, password: &str) -> Result<Identity> {
        let handle = normalize_handle(handle);
        if handle.is_empty() {
            return Err(SocialError::Validation("请输入用户名".to_string()).into());
        }
        let row = self.profiles.find_by_handle(&handle).await?;
        let email = match row {
            Some(row) if !row.email.is_empty() => row.email,
            _ => {
                return Err(SocialError::NotFound(format!("用户 {} 不存在", handle)).into());
            }
        };
        self.login(&email, password).await
    }

    /// 注册：校验表单 → 创建账号 → 写入资料行
    pub async fn register(&self, registration: Registration) -> Result<Identity> {
        registration.validate()?;
        let handle = registration.normalized_handle();

        if self.profiles.find_by_handle(&handle).await?.is_some() {
            return Err(SocialError::Validation(format!("用户名 {} 已被占用", handle)).into());
        }

        info!("[Session] 📝 注册: {} ({})", registration.email, handle);
        let session = self
            .auth
            .sign_up(
                registration.email.trim(),
                &registration.password,
                registration.metadata(),
            )
            .await
            .context("注册失败")?;

        let identity = Identity {
            id: session.user.id.clone(),
            name: registration.name.trim().to_string(),
            handle,
            email: registration.email.trim().to_string(),
            role: registration.role_or_default(),
            bio: registration.bio.trim().to_string(),
            avatar: registration.avatar.trim().to_string(),
        };
        if let Err(e) = self.profiles.upsert(&identity).await {
            if store_error(&e).is_some_and(|s| s.is_unique_violation()) {
                return Err(SocialError::Validation(format!(
                    "用户名 {} 已被占用",
                    identity.handle
                ))
                .into());
            }
            return Err(e.context("写入资料失败"));
        }

        self.set_identity(Some(identity.clone())).await;
        info!("[Session] ✅ 注册完成: {}", identity.id);
        Ok(identity)
    }

    pub async fn logout(&self) -> Result<()> {
        info!("[Session] 👋 登出");
        let result = self.auth.sign_out().await;
        self.set_identity(None).await;
        result.context("登出失败")?;
        Ok(())
    }

    /// 部分更新资料；只有写入成功后才合并到本地身份
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Identity> {
        let Some(mut identity) = self.current() else {
            return Err(SocialError::NotSignedIn.into());
        };
        let patch = update.to_patch();
        if patch.is_empty() {
            return Ok(identity);
        }

        if let Err(e) = self.profiles.update(&identity.id, patch).await {
            error!("[Session] ❌ 更新资料失败: {:#}", e);
            return Err(e.context("更新资料失败"));
        }
        update.apply_to(&mut identity);
        self.set_identity(Some(identity.clone())).await;
        info!("[Session] ✅ 资料已更新: {}", identity.handle);
        Ok(identity)
    }

    /// 跟随账号会话变化：登录时重新加载资料，登出时清空身份
    pub fn watch_auth_changes(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.auth.on_auth_state_change();
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let session = changes.borrow_and_update().clone();
                let Some(store) = store.upgrade() else {
                    break;
                };
                match session {
                    Some(session) if store.current_id().as_deref() != Some(session.user.id.as_str()) => {
                        info!("[Session] 🔄 会话切换到 {}", session.user.id);
                        store.establish(&session).await;
                    }
                    None if store.current_id().is_some() => {
                        info!("[Session] 会话已结束");
                        store.set_identity(None).await;
                    }
                    _ => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::memory::{MemoryBackend, StoreOp};
    use crate::social::store::tables;
    use serde_json::json;
    use crate::social::testing::{init_test_logger, wait_until};

    fn registration(handle: &str, email: &str) -> Registration {
        Registration {
            email: email.into(),
            password: "orbit42".into(),
            name: "Nova".into(),
            handle: handle.into(),
            bio: "Exploradora".into(),
            avatar: "https://cdn/a.png".into(),
            role: String::new(),
        }
    }

    #[tokio::test]
    async fn test_register_login_logout() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let backend = memory.backend();
        let store = SessionStore::new(&backend, &ClientConfig::local());

        let identity = store.register(registration("nova", "nova@space.io")).await.unwrap();
        assert_eq!(identity.handle, "@nova");
        assert_eq!(identity.role, "Cadete Espacial");
        assert_eq!(memory.rows(tables::PROFILES).len(), 1);

        store.logout().await.unwrap();
        assert!(store.current().is_none());

        let again = store.login_with_handle("nova", "orbit42").await.unwrap();
        assert_eq!(again, identity);
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn test_register_rejects_taken_handle() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let store = SessionStore::new(&memory.backend(), &ClientConfig::local());
        store.register(registration("nova", "nova@space.io")).await.unwrap();

        let err = store
            .register(registration("@nova", "other@space.io"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocialError>(),
            Some(SocialError::Validation(_))
        ));

        let err = store.register(registration("luna", "bad-email")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocialError>(),
            Some(SocialError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_or_failing_profile_degrades_to_guest() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let backend = memory.backend();
        backend
            .auth
            .sign_up("ghost@space.io", "orbit42", json!({}))
            .await
            .unwrap();
        backend.auth.sign_out().await.unwrap();

        let store = SessionStore::new(&backend, &ClientConfig::local());
        let identity = store.login("ghost@space.io", "orbit42").await.unwrap();
        assert_eq!(identity.handle, "@user");
        assert_eq!(identity.name, "User");

        memory.fail_next(StoreOp::Select, tables::PROFILES);
        let restored = store.restore().await.unwrap().unwrap();
        assert_eq!(restored.role, "user");
        assert_eq!(restored.email, "ghost@space.io");
    }

    #[tokio::test]
    async fn test_login_errors() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let store = SessionStore::new(&memory.backend(), &ClientConfig::local());
        store.register(registration("nova", "nova@space.io")).await.unwrap();
        store.logout().await.unwrap();

        assert!(store.login("nova@space.io", "wrong-password").await.is_err());
        assert!(store.current().is_none());

        let err = store.login_with_handle("@nobody", "orbit42").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocialError>(),
            Some(SocialError::NotFound(_))
        ));
        assert!(store.restore().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_profile_merges_after_success() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let store = SessionStore::new(&memory.backend(), &ClientConfig::local());

        let err = store.update_profile(ProfileUpdate::default()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SocialError>(), Some(&SocialError::NotSignedIn));

        store.register(registration("nova", "nova@space.io")).await.unwrap();

        memory.fail_next(StoreOp::Update, tables::PROFILES);
        let update = ProfileUpdate {
            bio: Some("Nueva bio".into()),
            name: Some(String::new()),
            ..Default::default()
        };
        assert!(store.update_profile(update.clone()).await.is_err());
        assert_eq!(store.current().unwrap().bio, "Exploradora");

        let updated = store.update_profile(update).await.unwrap();
        assert_eq!(updated.bio, "Nueva bio");
        assert_eq!(updated.name, "Nova");
        assert_eq!(memory.rows(tables::PROFILES)[0]["bio"], "Nueva bio");
    }

    #[tokio::test]
    async fn test_watch_auth_changes() {
        init_test_logger();
        let memory = MemoryBackend::new();
        let backend = memory.backend();
        let store = Arc::new(SessionStore::new(&backend, &ClientConfig::local()));
        store.register(registration("nova", "nova@space.io")).await.unwrap();
        let watcher = store.watch_auth_changes();

        backend.auth.sign_out().await.unwrap();
        assert!(wait_until(|| store.current().is_none()).await);
        watcher.abort();
    }
}
