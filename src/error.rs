use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("認証情報がありません")]
    Unauthenticated,

    #[error("権限がありません")]
    Forbidden,

    #[error("ストアエラー")]
    Store(#[from] sqlx::Error),

    #[error("ストアが応答しません")]
    StoreUnavailable,

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("二要素認証は既に有効です")]
    TwoFactorAlreadyEnabled,

    #[error("二要素認証の設定確認待ちではありません")]
    TwoFactorNotPending,

    #[error("二要素認証が有効化されていません")]
    TwoFactorNotEnabled,

    #[error("二要素認証の設定が開始されていません")]
    SetupNotFound,

    #[error("認証コードが無効です")]
    InvalidCode,

    #[error("確認情報が無効です")]
    InvalidConfirmation,

    #[error("デバイスが見つかりません")]
    DeviceNotFound,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::TwoFactorAlreadyEnabled
            | Self::TwoFactorNotPending
            | Self::TwoFactorNotEnabled
            | Self::InvalidCode
            | Self::InvalidConfirmation => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::SetupNotFound | Self::DeviceNotFound => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Validation(msg) => msg.clone(),
            Self::Unauthenticated => "認証が必要です".to_string(),
            Self::Forbidden => "この操作を行う権限がありません".to_string(),
            Self::Store(e) => {
                tracing::error!(error = ?e, "ストアエラー");
                "サービスが一時的に利用できません".to_string()
            }
            Self::StoreUnavailable => {
                tracing::error!("ストア応答タイムアウト");
                "サービスが一時的に利用できません".to_string()
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                "内部エラーが発生しました".to_string()
            }
            Self::TwoFactorAlreadyEnabled => "二要素認証は既に有効です".to_string(),
            Self::TwoFactorNotPending => {
                "二要素認証の設定を先に開始してください".to_string()
            }
            Self::TwoFactorNotEnabled => "二要素認証が有効化されていません".to_string(),
            Self::SetupNotFound => {
                "二要素認証の設定が開始されていません".to_string()
            }
            // 期限切れか誤りかを区別しない
            Self::InvalidCode => "認証コードが正しくありません".to_string(),
            Self::InvalidConfirmation => "確認情報が正しくありません".to_string(),
            Self::DeviceNotFound => "デバイスが見つかりません".to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
