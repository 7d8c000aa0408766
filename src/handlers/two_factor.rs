use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::extractors::AuthenticatedUser;
use crate::handlers::validate_request;
use crate::models::{ClientContext, NewTrustedDevice};
use crate::services::enrollment::{DisableConfirmation, SetupVerification};
use crate::state::AppState;

const DEFAULT_DEVICE_NAME: &str = "不明なデバイス";

// === 2FA Enable ===

#[derive(Debug, Serialize)]
pub struct EnableResponse {
    pub totp_secret: String,
    pub qr_code_url: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
    pub message: &'static str,
}

/// POST /api/2fa/enable
///
/// 2FA設定を開始（シークレット・QRコード・バックアップコードを返却）
///
/// # Security
/// - シークレット平文・バックアップコードはこのレスポンスでのみ返す
pub async fn enable_2fa(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
) -> Result<Json<EnableResponse>, AppError> {
    let started = state
        .enrollment
        .begin_enrollment(user.user_id, &user.account_label(), &client)
        .await?;

    Ok(Json(EnableResponse {
        totp_secret: started.secret,
        qr_code_url: started.qr_code_url,
        provisioning_uri: started.provisioning_uri,
        backup_codes: started.backup_codes,
        message: "認証アプリでQRコードを読み取り、表示されたコードで設定を完了してください",
    }))
}

// === QR Code ===

/// GET /api/2fa/qr-code
///
/// 設定中のQRコードをPNGで返す
pub async fn qr_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, AppError> {
    let png = state
        .enrollment
        .qr_code(user.user_id, &user.account_label())
        .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

// === Verify Setup ===

#[derive(Debug, Deserialize, Validate)]
pub struct VerifySetupRequest {
    #[garde(length(min = 1, max = 16))]
    pub totp_code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifySetupResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub enabled_at: OffsetDateTime,
    pub message: &'static str,
}

/// POST /api/2fa/verify-setup
///
/// 初回コード検証で2FAを有効化
///
/// # Security
/// - コードはログ出力禁止
/// - 期限切れか誤りかを区別しない
pub async fn verify_setup(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
    Json(request): Json<VerifySetupRequest>,
) -> Result<Json<VerifySetupResponse>, AppError> {
    validate_request(&request)?;

    match state
        .enrollment
        .complete_enrollment(user.user_id, &request.totp_code, &client)
        .await?
    {
        SetupVerification::Enabled { enabled_at } => Ok(Json(VerifySetupResponse {
            enabled_at,
            message: "二要素認証を有効化しました",
        })),
        SetupVerification::Rejected => Err(AppError::InvalidCode),
    }
}

// === 2FA Disable ===

#[derive(Debug, Deserialize, Validate)]
pub struct DisableRequest {
    #[garde(length(max = 256))]
    pub confirmation_password: Option<String>,
    #[garde(length(max = 32))]
    pub totp_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// POST /api/2fa/disable
///
/// 2FA無効化（パスワードまたは認証コードで本人確認）
///
/// # Security
/// - 信頼済みデバイスもすべて失効する
pub async fn disable_2fa(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
    Json(request): Json<DisableRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    validate_request(&request)?;

    state
        .enrollment
        .disable(
            user.user_id,
            DisableConfirmation {
                password: request.confirmation_password,
                code: request.totp_code,
            },
            &client,
        )
        .await?;

    Ok(Json(MessageResponse {
        message: "二要素認証を無効化しました",
    }))
}

// === Login Factor Verify ===

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyRequest {
    #[garde(length(min = 1, max = 32))]
    pub totp_code: Option<String>,
    #[garde(length(min = 1, max = 32))]
    pub backup_code: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub trust_device: bool,
    #[garde(length(min = 1, max = 100))]
    pub device_name: Option<String>,
    #[garde(length(min = 1, max = 256))]
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    pub method: Option<&'static str>,
    pub backup_codes_remaining: Option<usize>,
    pub backup_codes_low: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub device_expires_at: Option<OffsetDateTime>,
}

impl VerifyResponse {
    fn rejected() -> Self {
        Self {
            verified: false,
            method: None,
            backup_codes_remaining: None,
            backup_codes_low: None,
            device_token: None,
            device_expires_at: None,
        }
    }
}

/// POST /api/2fa/verify
///
/// ログイン時の第二要素検証（TOTP またはバックアップコード）
///
/// # Security
/// - 失敗時は 401、どの要素で失敗したかは返さない
/// - trust_device 指定時のみデバイストークンを発行
pub async fn verify_2fa(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
    Json(request): Json<VerifyRequest>,
) -> Result<Response, AppError> {
    validate_request(&request)?;

    let candidate = request
        .totp_code
        .as_deref()
        .or(request.backup_code.as_deref())
        .ok_or_else(|| {
            AppError::Validation("認証コードまたはバックアップコードは必須です".to_string())
        })?;

    if request.trust_device && request.device_fingerprint.is_none() {
        return Err(AppError::Validation(
            "デバイスを信頼する場合は device_fingerprint が必須です".to_string(),
        ));
    }

    let outcome = state
        .enrollment
        .verify_login_factor(user.user_id, candidate, &client)
        .await?;

    if !outcome.is_accepted() {
        return Ok((StatusCode::UNAUTHORIZED, Json(VerifyResponse::rejected())).into_response());
    }

    let summary = outcome.backup_codes();

    let mut response = VerifyResponse {
        verified: true,
        method: outcome.method(),
        backup_codes_remaining: summary.map(|s| s.remaining),
        backup_codes_low: summary.map(|s| s.low),
        device_token: None,
        device_expires_at: None,
    };

    // バックアップコードは消費済みのため、デバイス登録の失敗で検証結果を失わない
    if request.trust_device
        && let Some(device_fingerprint) = request.device_fingerprint
    {
        let device_name = request
            .device_name
            .or_else(|| client.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        let issued = state
            .devices
            .issue(
                user.user_id,
                NewTrustedDevice {
                    device_name,
                    device_fingerprint,
                    ip_address: client.ip_address.clone(),
                    user_agent: client.user_agent.clone(),
                },
                None,
            )
            .await;

        match issued {
            Ok(issued) => {
                response.device_expires_at = Some(issued.device.expires_at);
                response.device_token = Some(issued.token);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    user_id = %user.user_id,
                    "信頼済みデバイスの登録に失敗（検証は成功）"
                );
            }
        }
    }

    Ok(Json(response).into_response())
}

// === Backup Codes ===

#[derive(Debug, Serialize)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
    pub message: &'static str,
}

/// POST /api/2fa/backup-codes/generate
///
/// バックアップコードを再発行（以前のコードは無効）
pub async fn generate_backup_codes(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
) -> Result<Json<BackupCodesResponse>, AppError> {
    let set = state.ledger.regenerate(user.user_id, &client).await?;

    Ok(Json(BackupCodesResponse {
        backup_codes: set.codes,
        message: "新しいバックアップコードを安全な場所に保管してください。以前のコードは使用できません",
    }))
}

#[derive(Debug, Serialize)]
pub struct RemainingResponse {
    pub remaining: usize,
    pub total: usize,
    pub low: bool,
}

/// GET /api/2fa/backup-codes/remaining
pub async fn remaining_backup_codes(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<RemainingResponse>, AppError> {
    let summary = state.ledger.summary(user.user_id).await?;

    Ok(Json(RemainingResponse {
        remaining: summary.remaining,
        total: summary.total,
        low: summary.low,
    }))
}

// === Status ===

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    pub setup_started: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub enabled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    pub backup_codes_remaining: Option<usize>,
}

/// GET /api/2fa/status
pub async fn status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<StatusResponse>, AppError> {
    let status = state.enrollment.status(user.user_id).await?;

    Ok(Json(StatusResponse {
        enabled: status.enabled,
        setup_started: status.setup_started,
        enabled_at: status.enabled_at,
        last_used_at: status.last_used_at,
        backup_codes_remaining: status.backup_codes_remaining,
    }))
}
