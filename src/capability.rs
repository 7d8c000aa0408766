use crate::extractors::AuthenticatedUser;

/// プラットフォーム上のロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserRole {
    #[default]
    SiteOwner,
    Admin,
    Auditor,
    ComplianceOfficer,
    Executive,
}

impl UserRole {
    /// X-User-Role ヘッダー値を解釈（未知のロールは None）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "site_owner" => Some(Self::SiteOwner),
            "admin" => Some(Self::Admin),
            "auditor" => Some(Self::Auditor),
            "compliance_officer" => Some(Self::ComplianceOfficer),
            "executive" => Some(Self::Executive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// 自分の2FA設定の管理
    ManageOwnTwoFactor,
    /// 他ユーザーの2FA監査ログの閲覧
    ViewSecurityAudit,
}

pub fn has_capability(user: &AuthenticatedUser, capability: Capability) -> bool {
    match capability {
        Capability::ManageOwnTwoFactor => true,
        Capability::ViewSecurityAudit => matches!(
            user.role,
            UserRole::Admin | UserRole::Auditor | UserRole::ComplianceOfficer
        ),
    }
}
