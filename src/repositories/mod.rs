pub mod audit_event;
#[cfg(test)]
pub mod memory;
pub mod trusted_device;
pub mod two_factor_profile;
pub mod user;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AuditEvent, NewTrustedDevice, StoredAuditEvent, TrustedDevice, TwoFactorProfile,
};

pub use audit_event::AuditEventRepository;
pub use trusted_device::TrustedDeviceRepository;
pub use two_factor_profile::TwoFactorProfileRepository;
pub use user::UserRepository;

/// 二要素認証プロファイルの永続化
///
/// 状態遷移はすべて条件付き更新で行い、戻り値で成否を返す
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: Uuid)
    -> Result<Option<TwoFactorProfile>, sqlx::Error>;

    /// 新しい登録試行を PendingVerification で保存
    ///
    /// 既存行が Enabled の場合は上書きせず None を返す
    async fn upsert_pending(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<TwoFactorProfile>, sqlx::Error>;

    /// PendingVerification → Enabled（enabled_at を返す）
    ///
    /// 検証に使った secret が保存値と一致する場合のみ更新する
    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<Option<OffsetDateTime>, sqlx::Error>;

    /// Enabled → Disabled
    async fn mark_disabled(&self, user_id: Uuid) -> Result<bool, sqlx::Error>;

    async fn touch_last_verified(&self, user_id: Uuid) -> Result<(), sqlx::Error>;

    /// 発行済みかつ未使用のハッシュを使用済みにする（check-and-set）
    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str)
    -> Result<bool, sqlx::Error>;

    /// 発行済みセットを置き換え、使用済みをクリア（Enabled のみ）
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        backup_code_hashes: &[String],
    ) -> Result<bool, sqlx::Error>;
}

/// 信頼済みデバイスの永続化
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn insert(
        &self,
        user_id: Uuid,
        device: &NewTrustedDevice,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<TrustedDevice, sqlx::Error>;

    /// (user_id, token_hash, device_fingerprint) がすべて一致する有効なデバイス
    async fn find_active_by_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device_fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, sqlx::Error>;

    async fn touch_last_used(
        &self,
        device_id: Uuid,
        used_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// 失効済みも含めて検索
    async fn find_for_user(
        &self,
        device_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TrustedDevice>, sqlx::Error>;

    async fn deactivate(&self, device_id: Uuid, user_id: Uuid) -> Result<(), sqlx::Error>;

    async fn deactivate_all_for_user(&self, user_id: Uuid) -> Result<u64, sqlx::Error>;

    /// 有効なデバイスを last_used_at の降順で返す
    async fn list_active_for_user(&self, user_id: Uuid)
    -> Result<Vec<TrustedDevice>, sqlx::Error>;
}

/// 監査イベントの永続化
#[async_trait]
pub trait AuditEventStore: Send + Sync {
    async fn insert(&self, event: &AuditEvent) -> Result<(), sqlx::Error>;

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoredAuditEvent>, sqlx::Error>;
}

/// ストア呼び出しにデッドラインを適用
///
/// タイムアウトは StoreUnavailable として扱う（検証成功とはみなさない）
pub async fn within<T, F>(deadline: Duration, operation: &'static str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = deadline.as_millis() as u64,
                "ストア呼び出しがタイムアウト"
            );
            Err(AppError::StoreUnavailable)
        }
    }
}
