//! 错误类型
//!
//! `StoreError` 描述与托管后端（鉴权 / 数据表 / 实时通道）交互时的失败，
//! `SocialError` 描述业务规则层面的拒绝。服务层统一返回 `anyhow::Result`，
//! 调用方可通过 `downcast_ref` 还原具体类型。

use thiserror::Error;

/// Postgres 唯一约束冲突的错误码
pub const UNIQUE_VIOLATION: &str = "23505";

/// 与后端交互时的错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("服务端错误 {status} [{code}]: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("反序列化响应失败: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("未登录或会话已过期")]
    Unauthorized,

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("实时通道错误: {0}")]
    Channel(String),
}

impl StoreError {
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// 是否为唯一约束冲突（例如重复点赞、重复好友申请）
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::Api { code, .. } if code == UNIQUE_VIOLATION)
    }
}

/// 业务规则错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocialError {
    #[error("{0}")]
    Validation(String),

    #[error("双方之间已存在好友关系记录")]
    Conflict,

    #[error("无权执行该操作: {0}")]
    Forbidden(String),

    #[error("记录不存在: {0}")]
    NotFound(String),

    #[error("当前状态不允许该操作: {0}")]
    InvalidState(String),

    #[error("尚未登录")]
    NotSignedIn,
}

/// 从 anyhow 错误链中取出业务错误
pub fn social_error(err: &anyhow::Error) -> Option<&SocialError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SocialError>())
}

/// 从 anyhow 错误链中取出后端错误
pub fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_unique_violation_detection() {
        assert!(StoreError::api(409, "23505", "duplicate key").is_unique_violation());
        assert!(!StoreError::api(400, "22P02", "invalid input").is_unique_violation());
        assert!(!StoreError::Unauthorized.is_unique_violation());
    }

    #[test]
    fn test_errors_survive_context() {
        let err = Err::<(), _>(SocialError::Conflict)
            .context("发送好友申请失败")
            .unwrap_err();
        assert_eq!(social_error(&err), Some(&SocialError::Conflict));

        let err = Err::<(), _>(StoreError::api(409, UNIQUE_VIOLATION, "dup"))
            .context("点赞失败")
            .unwrap_err();
        assert!(store_error(&err).is_some_and(StoreError::is_unique_violation));
    }
}
