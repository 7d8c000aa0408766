use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 監査イベント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    EnrollmentStarted,
    EnrollmentVerified,
    TwoFactorDisabled,
    LoginFactorVerified,
    BackupCodesRegenerated,
    DeviceTrusted,
    DeviceVerified,
    DeviceRevoked,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnrollmentStarted => "enrollment_started",
            Self::EnrollmentVerified => "enrollment_verified",
            Self::TwoFactorDisabled => "two_factor_disabled",
            Self::LoginFactorVerified => "login_factor_verified",
            Self::BackupCodesRegenerated => "backup_codes_regenerated",
            Self::DeviceTrusted => "device_trusted",
            Self::DeviceVerified => "device_verified",
            Self::DeviceRevoked => "device_revoked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// 監査シンクに送るイベント
///
/// detail にはコード・トークン等の秘密情報を含めないこと
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: OffsetDateTime,
}

impl AuditEvent {
    pub fn new(user_id: Uuid, kind: AuditEventKind, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            outcome,
            detail: None,
            ip_address: None,
            user_agent: None,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// 永続化された監査イベント（一覧表示用）
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredAuditEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}
