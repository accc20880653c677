//! Space Community 客户端核心
//!
//! 会话、好友关系状态机、通知/未读对账、会话视图与社区动态。
//! 所有状态都来自托管后端，通过三个接缝访问：鉴权、数据表、实时变更通道。

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod feed;
pub mod friend;
pub mod memory;
pub mod notification;
pub mod realtime;
pub mod serialization;
pub mod session;
pub mod store;
pub mod types;

use crate::social::config::ClientConfig;
use crate::social::realtime::{Changefeed, RealtimeSocket};
use crate::social::session::auth::{AuthProvider, GoTrueAuth};
use crate::social::store::{DataStore, RestStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// 托管后端的三个接缝
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthProvider>,
    pub store: Arc<dyn DataStore>,
    pub realtime: Arc<dyn Changefeed>,
}

impl Backend {
    /// 连接托管后端：鉴权 + PostgREST + 实时通道（实时连接在第一次订阅时建立）
    pub fn remote(config: &ClientConfig) -> Result<Self> {
        info!("[Backend] 🌐 使用托管后端: {}", config.supabase_url);
        let auth = GoTrueAuth::new(config)?;
        let session = auth.on_auth_state_change();
        let store = RestStore::new(config, session.clone())?;
        let realtime = RealtimeSocket::new(config, session);
        Ok(Self {
            auth: Arc::new(auth),
            store: Arc::new(store),
            realtime: Arc::new(realtime),
        })
    }
}
