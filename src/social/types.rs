use crate::social::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

/// 后端错误响应体
///
/// 同时兼容 PostgREST（`code/message/details/hint`）与鉴权服务
/// （`code/error_code/msg` 或 `error/error_description`）两种格式
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, deserialize_with = "deserialize_code")]
    pub code: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "msg", alias = "error_description")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl ApiErrorBody {
    /// 转换为 `StoreError`，优先使用字符串错误码
    pub fn into_store_error(self, status: u16, fallback: &str) -> StoreError {
        if status == 401 {
            return StoreError::Unauthorized;
        }
        let code = self
            .error_code
            .or(self.error)
            .filter(|c| !c.is_empty())
            .unwrap_or(self.code);
        let mut message = self.message.unwrap_or_else(|| fallback.to_string());
        if let Some(details) = self.details.filter(|d| !d.is_empty()) {
            message = format!("{} ({})", message, details);
        }
        StoreError::api(status, code, message)
    }
}

/// 错误码既可能是字符串（"23505"）也可能是数字（400）
fn deserialize_code<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Deserialize::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

/// 通用 HTTP 响应处理：检查状态码，失败时解析错误体，成功时返回原始 body
pub async fn read_http_response(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ResponseBody, StoreError> {
    let status = response.status();
    let body_bytes = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        let body: ApiErrorBody = serde_json::from_slice(&body_bytes).unwrap_or_default();
        return Err(body.into_store_error(status.as_u16(), &body_str));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);
    Ok(ResponseBody(body_bytes.to_vec()))
}

/// 通用 HTTP 响应处理：成功时直接反序列化为目标类型
///
/// 空 body（例如返回 void 的 RPC）按 JSON `null` 处理
pub async fn handle_http_response<T: DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T, StoreError> {
    let body = read_http_response(response, operation_name).await?;
    body.decode(operation_name)
}

/// 已读取完毕的响应 body
pub struct ResponseBody(pub Vec<u8>);

impl ResponseBody {
    pub fn decode<T: DeserializeOwned>(&self, operation_name: &str) -> Result<T, StoreError> {
        let bytes: &[u8] = if self.0.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &self.0
        };
        serde_json::from_slice(bytes).map_err(|e| {
            error!(
                "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
                operation_name,
                e,
                String::from_utf8_lossy(&self.0)
            );
            StoreError::Decode(e)
        })
    }
}
