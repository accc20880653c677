//! 客户端配置

use anyhow::{Context, Result};
use std::time::Duration;

/// 连接托管后端所需的配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 项目地址，例如 `https://xyz.supabase.co`
    pub supabase_url: String,
    /// 匿名公钥（作为 `apikey` 头发送）
    pub anon_key: String,
    /// 数据表所在 schema
    pub schema: String,
    /// 通知列表每次拉取的条数
    pub notification_page_size: usize,
    /// 登录后拉取个人资料的超时时间
    pub profile_fetch_timeout: Duration,
    /// 用户搜索的最少字符数
    pub search_min_chars: usize,
    /// 用户搜索返回的最多条数
    pub search_limit: usize,
    /// 实时通道心跳间隔
    pub heartbeat_interval: Duration,
    /// 订阅加入确认的等待时间
    pub join_timeout: Duration,
}

impl ClientConfig {
    pub fn new(supabase_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            supabase_url: supabase_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            schema: "public".to_string(),
            notification_page_size: 20,
            profile_fetch_timeout: Duration::from_secs(5),
            search_min_chars: 3,
            search_limit: 5,
            heartbeat_interval: Duration::from_secs(25),
            join_timeout: Duration::from_secs(10),
        }
    }

    /// 从环境变量（以及当前目录下的 `.env`）读取配置
    ///
    /// 必填：`SUPABASE_URL`、`SUPABASE_ANON_KEY`；
    /// 可选：`SPACE_NOTIFICATION_PAGE`、`SPACE_PROFILE_TIMEOUT_MS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("SUPABASE_URL").context("缺少环境变量 SUPABASE_URL")?;
        let key = std::env::var("SUPABASE_ANON_KEY").context("缺少环境变量 SUPABASE_ANON_KEY")?;
        let mut config = Self::new(url, key);

        if let Ok(page) = std::env::var("SPACE_NOTIFICATION_PAGE") {
            config.notification_page_size = page
                .parse()
                .context("SPACE_NOTIFICATION_PAGE 不是合法的数字")?;
        }
        if let Ok(ms) = std::env::var("SPACE_PROFILE_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("SPACE_PROFILE_TIMEOUT_MS 不是合法的数字")?;
            config.profile_fetch_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// 用于进程内后端的配置（地址与密钥不会被使用）
    pub fn local() -> Self {
        Self::new("http://localhost:54321", "local-anon-key")
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.supabase_url)
    }

    pub fn auth_url(&self) -> String {
        format!("{}/auth/v1", self.supabase_url)
    }

    /// 实时通道 WebSocket 地址（http → ws，https → wss）
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.supabase_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.supabase_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.supabase_url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base, self.anon_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let config = ClientConfig::new("https://demo.supabase.co/", "anon");
        assert_eq!(config.rest_url(), "https://demo.supabase.co/rest/v1");
        assert_eq!(config.auth_url(), "https://demo.supabase.co/auth/v1");
        assert_eq!(
            config.realtime_url(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = ClientConfig::new("http://127.0.0.1:54321", "k");
        assert!(local.realtime_url().starts_with("ws://127.0.0.1:54321/realtime/v1"));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::local();
        assert_eq!(config.notification_page_size, 20);
        assert_eq!(config.profile_fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.search_min_chars, 3);
        assert_eq!(config.search_limit, 5);
    }
}
