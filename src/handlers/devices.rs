use axum::{
    Json,
    extract::{Path, State},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::extractors::AuthenticatedUser;
use crate::handlers::validate_request;
use crate::models::ClientContext;
use crate::services::trusted_device::DeviceSummary;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub device_id: Uuid,
    pub device_name: String,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub is_expired: bool,
}

impl From<DeviceSummary> for DeviceResponse {
    fn from(summary: DeviceSummary) -> Self {
        let device = summary.device;
        Self {
            device_id: device.device_id,
            device_name: device.device_name,
            ip_address: device.ip_address,
            created_at: device.created_at,
            last_used_at: device.last_used_at,
            expires_at: device.expires_at,
            is_expired: summary.is_expired,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceResponse>,
}

/// GET /api/2fa/devices
///
/// 有効な信頼済みデバイス一覧
pub async fn list_devices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<DeviceListResponse>, AppError> {
    let devices = state.devices.list(user.user_id).await?;

    Ok(Json(DeviceListResponse {
        devices: devices.into_iter().map(DeviceResponse::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub message: &'static str,
}

/// DELETE /api/2fa/devices/{device_id}
///
/// 信頼済みデバイスを失効（冪等）
pub async fn revoke_device(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientContext,
    Path(device_id): Path<Uuid>,
) -> Result<Json<RevokeResponse>, AppError> {
    state
        .devices
        .revoke(device_id, user.user_id, &client)
        .await?;

    Ok(Json(RevokeResponse {
        message: "デバイスの信頼を解除しました",
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyDeviceRequest {
    #[garde(length(min = 1, max = 128))]
    pub device_token: String,
    #[garde(length(min = 1, max = 256))]
    pub device_fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyDeviceResponse {
    pub trusted: bool,
}

/// POST /api/2fa/devices/verify
///
/// デバイストークンで2FAをスキップできるか確認
///
/// # Security
/// - トークンはログ出力禁止
/// - 失敗理由は返さない
pub async fn verify_device(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<VerifyDeviceRequest>,
) -> Result<Json<VerifyDeviceResponse>, AppError> {
    validate_request(&request)?;

    let trusted = state
        .devices
        .verify(
            &request.device_token,
            user.user_id,
            &request.device_fingerprint,
        )
        .await?;

    Ok(Json(VerifyDeviceResponse { trusted }))
}
