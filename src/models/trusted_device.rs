use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 2FA をスキップできる信頼済みデバイス
///
/// トークン平文は保存しない（token_hash のみ）
/// 失効時は is_active = false にし、行は監査用に残す
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TrustedDevice {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub device_name: String,
    #[serde(skip)]
    pub device_fingerprint: String,
    #[serde(skip)]
    pub token_hash: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_used_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub is_active: bool,
}

impl TrustedDevice {
    /// 有効期限切れかどうか（expires_at は固定、延長しない）
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        is_expired(now, self.expires_at)
    }

    /// is_active かつ期限内のときのみ利用可能
    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

pub fn is_expired(now: OffsetDateTime, expires_at: OffsetDateTime) -> bool {
    now >= expires_at
}

/// 新規登録する信頼済みデバイスの情報
#[derive(Debug, Clone)]
pub struct NewTrustedDevice {
    pub device_name: String,
    pub device_fingerprint: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}
