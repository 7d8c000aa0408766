use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 二要素認証の状態
///
/// 未設定（NotConfigured）は行が存在しないことで表す
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "two_factor_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorState {
    PendingVerification,
    Enabled,
    Disabled,
}

/// ユーザーの二要素認証プロファイル
///
/// TOTPシークレットは AES-256-GCM で暗号化されて保存される
/// バックアップコードは SHA-256 ハッシュのみ保存
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TwoFactorProfile {
    pub user_id: Uuid,
    #[serde(skip)]
    pub totp_secret_encrypted: Vec<u8>,
    pub state: TwoFactorState,
    #[serde(skip)]
    pub backup_codes_hash: Vec<String>,
    #[serde(skip)]
    pub backup_codes_used: Vec<String>,
    pub created_at: OffsetDateTime,
    pub enabled_at: Option<OffsetDateTime>,
    pub last_verified_at: Option<OffsetDateTime>,
}

impl TwoFactorProfile {
    pub fn is_enabled(&self) -> bool {
        self.state == TwoFactorState::Enabled
    }

    pub fn is_pending(&self) -> bool {
        self.state == TwoFactorState::PendingVerification
    }

    /// ハッシュが使用済みかどうか
    pub fn is_consumed(&self, code_hash: &str) -> bool {
        self.backup_codes_used.iter().any(|used| used == code_hash)
    }
}
