//! 调用方身份
//!
//! 认证由上游网关完成，网关把用户ID写在 `X-User-Id` 头里；这里只负责解析。

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ServerError;
use crate::model::UserId;

pub const USER_ID_HEADER: &str = "x-user-id";

/// 从 `X-User-Id` 头解析出的调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayUser(pub UserId);

impl<S> FromRequestParts<S> for GatewayUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ServerError::Unauthorized("缺少 X-User-Id 头".to_string()))?;
        let user_id = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .ok_or_else(|| ServerError::Unauthorized("无效的 X-User-Id".to_string()))?;
        Ok(GatewayUser(user_id))
    }
}
