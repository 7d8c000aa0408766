use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::capability::UserRole;
use crate::error::AppError;
use crate::models::ClientContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// 上流ゲートウェイで一次認証済みのユーザー
///
/// X-User-Id は必須。ゲートウェイ以外からの直接アクセスは想定しない
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: UserRole,
}

impl AuthenticatedUser {
    /// 認証アプリに表示するアカウント名
    pub fn account_label(&self) -> String {
        self.email
            .clone()
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, USER_ID_HEADER)
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| {
                tracing::debug!("X-User-Id ヘッダーがない、または不正");
                AppError::Unauthenticated
            })?;

        let email = header_value(parts, USER_EMAIL_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let role = header_value(parts, USER_ROLE_HEADER)
            .and_then(UserRole::parse)
            .unwrap_or_default();

        Ok(Self {
            user_id,
            email,
            role,
        })
    }
}

impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // プロキシ経由の場合は X-Forwarded-For の先頭を使う
        let ip_address = header_value(parts, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .or_else(|| header_value(parts, "x-real-ip"))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let user_agent = header_value(parts, "user-agent").map(str::to_string);

        Ok(Self {
            ip_address,
            user_agent,
        })
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}
