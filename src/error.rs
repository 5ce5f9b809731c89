use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 服务器错误类型
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ServerError {
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(String),
    /// 无效请求
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// 身份缺失（未注册用户 / 缺少 X-User-Id）
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// 非会话参与者
    #[error("Forbidden: {0}")]
    Forbidden(String),
    /// 会话未找到
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    /// 消息未找到
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    /// 通话未找到
    #[error("Call not found: {0}")]
    CallNotFound(String),
    /// 资源未找到
    #[error("Not found: {0}")]
    NotFound(String),
    /// 重复条目
    #[error("Duplicate entry: {0}")]
    Duplicate(String),
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),
    /// Presence/Redis 存储错误
    #[error("Store error: {0}")]
    Store(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 协议错误（无法解析的帧）
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 服务不可用
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ServerError {
    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Validation(_) | ServerError::BadRequest(_) | ServerError::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::ConversationNotFound(_)
            | ServerError::MessageNotFound(_)
            | ServerError::CallNotFound(_)
            | ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Duplicate(_) => StatusCode::CONFLICT,
            ServerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        if status_code.is_server_error() {
            tracing::error!("❌ 请求处理失败: {}", self);
        }
        let error_response = ErrorResponse::new(&self);
        (status_code, Json(error_response)).into_response()
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout(err.to_string())
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServerError::NotFound("row not found".to_string()),
            other => ServerError::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for ServerError {
    fn from(err: redis::RedisError) -> Self {
        ServerError::Store(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServerError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Internal = 1000,
    Validation = 1003,
    Unauthorized = 1001,
    Forbidden = 1002,
    ConversationNotFound = 1005,
    MessageNotFound = 1006,
    CallNotFound = 1008,
    Database = 2000,
    Store = 2004,
    Serialization = 2002,
    Configuration = 2003,
    Timeout = 3002,
    BadRequest = 4001,
    Duplicate = 4002,
    ServiceUnavailable = 5000,
    Protocol = 5003,
    NotFound = 5005,
}

impl From<&ServerError> for ErrorCode {
    fn from(error: &ServerError) -> Self {
        match error {
            ServerError::Internal(_) => ErrorCode::Internal,
            ServerError::Validation(_) => ErrorCode::Validation,
            ServerError::BadRequest(_) => ErrorCode::BadRequest,
            ServerError::Unauthorized(_) => ErrorCode::Unauthorized,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::ConversationNotFound(_) => ErrorCode::ConversationNotFound,
            ServerError::MessageNotFound(_) => ErrorCode::MessageNotFound,
            ServerError::CallNotFound(_) => ErrorCode::CallNotFound,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Duplicate(_) => ErrorCode::Duplicate,
            ServerError::Database(_) => ErrorCode::Database,
            ServerError::Store(_) => ErrorCode::Store,
            ServerError::Serialization(_) => ErrorCode::Serialization,
            ServerError::Configuration(_) => ErrorCode::Configuration,
            ServerError::Protocol(_) => ErrorCode::Protocol,
            ServerError::Timeout(_) => ErrorCode::Timeout,
            ServerError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
        }
    }
}

/// 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 时间戳
    pub timestamp: u64,
}

impl ErrorResponse {
    /// 创建错误响应
    pub fn new(error: &ServerError) -> Self {
        Self {
            code: ErrorCode::from(error),
            message: error.to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}
