use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AuditEvent, AuditEventKind, AuditOutcome, ClientContext, NewTrustedDevice, TrustedDevice,
};
use crate::repositories::{DeviceStore, within};
use crate::services::audit::AuditSink;

const TOKEN_BYTES: usize = 32;

/// 発行直後の信頼済みデバイス（token は平文、この時だけ返す）
#[derive(Debug, Clone)]
pub struct IssuedDevice {
    pub device: TrustedDevice,
    pub token: String,
}

/// 一覧表示用
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub device: TrustedDevice,
    pub is_expired: bool,
}

/// 信頼済みデバイス（2FAスキップ用トークン）の管理
#[derive(Clone)]
pub struct TrustedDeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    audit: Arc<dyn AuditSink>,
    default_ttl: time::Duration,
    deadline: Duration,
}

impl TrustedDeviceRegistry {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        audit: Arc<dyn AuditSink>,
        default_ttl: time::Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            devices,
            audit,
            default_ttl,
            deadline,
        }
    }

    /// デバイスを信頼済みとして登録し、トークンを発行
    ///
    /// # Security
    /// - トークンは32バイトのCSPRNG、DBにはSHA256ハッシュのみ保存
    /// - 有効期限は発行時に固定（利用しても延長しない）
    pub async fn issue(
        &self,
        user_id: Uuid,
        device: NewTrustedDevice,
        ttl: Option<time::Duration>,
    ) -> Result<IssuedDevice, AppError> {
        let token = generate_device_token();
        let token_hash = hash_device_token(&token);
        let expires_at = OffsetDateTime::now_utc() + ttl.unwrap_or(self.default_ttl);

        let stored = within(
            self.deadline,
            "device.insert",
            self.devices.insert(user_id, &device, &token_hash, expires_at),
        )
        .await?;

        self.audit.record(
            AuditEvent::new(user_id, AuditEventKind::DeviceTrusted, AuditOutcome::Success)
                .with_detail(stored.device_id.to_string())
                .with_client(device.ip_address.clone(), device.user_agent.clone()),
        );

        tracing::info!(
            user_id = %user_id,
            device_id = %stored.device_id,
            "信頼済みデバイス登録"
        );

        Ok(IssuedDevice {
            device: stored,
            token,
        })
    }

    /// トークンとフィンガープリントを検証
    ///
    /// どの条件で失敗したかは返さない
    pub async fn verify(
        &self,
        token: &str,
        user_id: Uuid,
        device_fingerprint: &str,
    ) -> Result<bool, AppError> {
        self.verify_at(token, user_id, device_fingerprint, OffsetDateTime::now_utc())
            .await
    }

    pub async fn verify_at(
        &self,
        token: &str,
        user_id: Uuid,
        device_fingerprint: &str,
        now: OffsetDateTime,
    ) -> Result<bool, AppError> {
        if token.is_empty() || device_fingerprint.is_empty() {
            return Ok(false);
        }

        let token_hash = hash_device_token(token);
        let device = within(
            self.deadline,
            "device.find_active_by_token",
            self.devices
                .find_active_by_token(user_id, &token_hash, device_fingerprint),
        )
        .await?;

        let Some(device) = device.filter(|d| d.is_usable_at(now)) else {
            self.audit.record(AuditEvent::new(
                user_id,
                AuditEventKind::DeviceVerified,
                AuditOutcome::Failure,
            ));
            tracing::debug!(user_id = %user_id, "信頼済みデバイス検証失敗");
            return Ok(false);
        };

        // last_used_at は参考情報のため失敗しても検証結果は変えない
        if let Err(e) = within(
            self.deadline,
            "device.touch_last_used",
            self.devices.touch_last_used(device.device_id, now),
        )
        .await
        {
            tracing::warn!(error = %e, device_id = %device.device_id, "last_used_at の更新に失敗");
        }

        self.audit.record(
            AuditEvent::new(user_id, AuditEventKind::DeviceVerified, AuditOutcome::Success)
                .with_detail(device.device_id.to_string()),
        );

        Ok(true)
    }

    /// デバイスを失効（冪等）
    ///
    /// 他ユーザーのデバイスは存在しないものとして扱う
    pub async fn revoke(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<(), AppError> {
        let device = within(
            self.deadline,
            "device.find_for_user",
            self.devices.find_for_user(device_id, user_id),
        )
        .await?
        .ok_or(AppError::DeviceNotFound)?;

        if !device.is_active {
            return Ok(());
        }

        within(
            self.deadline,
            "device.deactivate",
            self.devices.deactivate(device_id, user_id),
        )
        .await?;

        self.audit.record(
            AuditEvent::new(user_id, AuditEventKind::DeviceRevoked, AuditOutcome::Success)
                .with_detail(device_id.to_string())
                .with_client(client.ip_address.clone(), client.user_agent.clone()),
        );

        tracing::info!(user_id = %user_id, device_id = %device_id, "信頼済みデバイス失効");

        Ok(())
    }

    /// ユーザーの全デバイスを失効
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let count = within(
            self.deadline,
            "device.deactivate_all_for_user",
            self.devices.deactivate_all_for_user(user_id),
        )
        .await?;

        tracing::info!(user_id = %user_id, count, "信頼済みデバイスを一括失効");

        Ok(count)
    }

    /// 有効なデバイス一覧（最終利用日時の新しい順）
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<DeviceSummary>, AppError> {
        let now = OffsetDateTime::now_utc();
        let devices = within(
            self.deadline,
            "device.list_active_for_user",
            self.devices.list_active_for_user(user_id),
        )
        .await?;

        Ok(devices
            .into_iter()
            .map(|device| DeviceSummary {
                is_expired: device.is_expired_at(now),
                device,
            })
            .collect())
    }
}

fn generate_device_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_device_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
