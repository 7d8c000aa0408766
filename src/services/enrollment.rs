use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AuditEvent, AuditEventKind, AuditOutcome, ClientContext, TwoFactorProfile, TwoFactorState,
};
use crate::repositories::{ProfileStore, within};
use crate::services::audit::AuditSink;
use crate::services::auth::CredentialVerifier;
use crate::services::backup_codes::generate_backup_codes;
use crate::services::backup_ledger::{BackupCodeLedger, BackupCodeSummary};
use crate::services::totp::TotpService;
use crate::services::trusted_device::TrustedDeviceRegistry;

/// 登録開始の結果（平文はこの時だけ返す）
#[derive(Debug, Clone)]
pub struct EnrollmentStarted {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_code_url: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupVerification {
    Enabled { enabled_at: OffsetDateTime },
    Rejected,
}

/// 無効化時の本人確認（少なくとも一方が必要）
#[derive(Debug, Clone, Default)]
pub struct DisableConfirmation {
    pub password: Option<String>,
    pub code: Option<String>,
}

/// ログイン時の第二要素検証結果
///
/// 受理時は検証後のバックアップコード残数を持つ（消費後にストアを読み直さない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFactorOutcome {
    AcceptedTotp { backup_codes: BackupCodeSummary },
    AcceptedBackupCode { backup_codes: BackupCodeSummary },
    Rejected,
}

impl LoginFactorOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    pub fn method(&self) -> Option<&'static str> {
        match self {
            Self::AcceptedTotp { .. } => Some("totp"),
            Self::AcceptedBackupCode { .. } => Some("backup_code"),
            Self::Rejected => None,
        }
    }

    pub fn backup_codes(&self) -> Option<BackupCodeSummary> {
        match self {
            Self::AcceptedTotp { backup_codes } | Self::AcceptedBackupCode { backup_codes } => {
                Some(*backup_codes)
            }
            Self::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub setup_started: bool,
    pub enabled_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub backup_codes_remaining: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentPolicy {
    /// 前後何ステップまで許容するか
    pub totp_window: u8,
    pub store_timeout: Duration,
}

/// 二要素認証の登録・検証・無効化
#[derive(Clone)]
pub struct EnrollmentService {
    profiles: Arc<dyn ProfileStore>,
    totp: TotpService,
    ledger: BackupCodeLedger,
    devices: TrustedDeviceRegistry,
    credentials: Arc<dyn CredentialVerifier>,
    audit: Arc<dyn AuditSink>,
    policy: EnrollmentPolicy,
}

impl EnrollmentService {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        totp: TotpService,
        ledger: BackupCodeLedger,
        devices: TrustedDeviceRegistry,
        credentials: Arc<dyn CredentialVerifier>,
        audit: Arc<dyn AuditSink>,
        policy: EnrollmentPolicy,
    ) -> Self {
        Self {
            profiles,
            totp,
            ledger,
            devices,
            credentials,
            audit,
            policy,
        }
    }

    /// 登録を開始
    ///
    /// シークレットとバックアップコードを新規生成し、PendingVerification で保存
    /// 未完了の登録や無効化済みのプロファイルは上書きする
    ///
    /// # Security
    /// - シークレット平文・バックアップコードはログ出力禁止
    pub async fn begin_enrollment(
        &self,
        user_id: Uuid,
        account_label: &str,
        client: &ClientContext,
    ) -> Result<EnrollmentStarted, AppError> {
        if self
            .load_profile(user_id)
            .await?
            .is_some_and(|profile| profile.is_enabled())
        {
            return Err(AppError::TwoFactorAlreadyEnabled);
        }

        let secret = TotpService::generate_shared_secret();
        let encrypted = self.totp.encrypt_secret(&secret)?;
        let backup_codes = generate_backup_codes(self.ledger.code_count());

        let provisioning_uri = self
            .totp
            .provisioning_uri(&secret, account_label)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("provisioning uri error")))?;
        let qr_code_url = self.totp.qr_code_data_url(&secret, account_label)?;

        let stored = within(
            self.policy.store_timeout,
            "profile.upsert_pending",
            self.profiles
                .upsert_pending(user_id, &encrypted, &backup_codes.hashes),
        )
        .await?;

        // 読み込み後に別リクエストで有効化された
        if stored.is_none() {
            return Err(AppError::TwoFactorAlreadyEnabled);
        }

        self.record(
            user_id,
            AuditEventKind::EnrollmentStarted,
            AuditOutcome::Success,
            None,
            client,
        );
        tracing::info!(user_id = %user_id, "2FA設定開始");

        Ok(EnrollmentStarted {
            secret,
            provisioning_uri,
            qr_code_url,
            backup_codes: backup_codes.codes,
        })
    }

    /// 初回コードを検証して有効化
    ///
    /// # Security
    /// - コードはログ出力禁止
    pub async fn complete_enrollment(
        &self,
        user_id: Uuid,
        candidate: &str,
        client: &ClientContext,
    ) -> Result<SetupVerification, AppError> {
        let profile = self
            .load_profile(user_id)
            .await?
            .filter(TwoFactorProfile::is_pending)
            .ok_or(AppError::TwoFactorNotPending)?;

        let secret = self.totp.decrypt_secret(&profile.totp_secret_encrypted)?;
        if !self
            .totp
            .verify_totp(&secret, candidate, self.policy.totp_window)
        {
            self.record(
                user_id,
                AuditEventKind::EnrollmentVerified,
                AuditOutcome::Failure,
                None,
                client,
            );
            tracing::warn!(user_id = %user_id, "2FA設定確認失敗: コード不一致");
            return Ok(SetupVerification::Rejected);
        }

        let enabled_at = within(
            self.policy.store_timeout,
            "profile.mark_enabled",
            self.profiles
                .mark_enabled(user_id, &profile.totp_secret_encrypted),
        )
        .await?
        .ok_or(AppError::TwoFactorNotPending)?;

        self.record(
            user_id,
            AuditEventKind::EnrollmentVerified,
            AuditOutcome::Success,
            None,
            client,
        );
        tracing::info!(user_id = %user_id, "2FA有効化完了");

        Ok(SetupVerification::Enabled { enabled_at })
    }

    /// 2FAを無効化
    ///
    /// 指定された確認情報はすべて検証する。バックアップコードで確認した場合は消費される
    /// 信頼済みデバイスを先に失効させてから状態を Disabled にする
    pub async fn disable(
        &self,
        user_id: Uuid,
        confirmation: DisableConfirmation,
        client: &ClientContext,
    ) -> Result<(), AppError> {
        let profile = self
            .load_profile(user_id)
            .await?
            .filter(TwoFactorProfile::is_enabled)
            .ok_or(AppError::TwoFactorNotEnabled)?;

        let password = confirmation.password.filter(|p| !p.is_empty());
        let code = confirmation.code.filter(|c| !c.trim().is_empty());
        if password.is_none() && code.is_none() {
            return Err(AppError::Validation(
                "パスワードまたは認証コードを入力してください".to_string(),
            ));
        }

        if let Some(password) = password
            && !self.credentials.verify_password(user_id, &password).await?
        {
            self.record(
                user_id,
                AuditEventKind::TwoFactorDisabled,
                AuditOutcome::Failure,
                Some("password"),
                client,
            );
            return Err(AppError::InvalidConfirmation);
        }

        if let Some(code) = code {
            let secret = self.totp.decrypt_secret(&profile.totp_secret_encrypted)?;
            let confirmed = self
                .totp
                .verify_totp(&secret, &code, self.policy.totp_window)
                || self.ledger.mark_used(user_id, &code).await?;
            if !confirmed {
                self.record(
                    user_id,
                    AuditEventKind::TwoFactorDisabled,
                    AuditOutcome::Failure,
                    Some("code"),
                    client,
                );
                return Err(AppError::InvalidConfirmation);
            }
        }

        self.devices.revoke_all_for_user(user_id).await?;

        let disabled = within(
            self.policy.store_timeout,
            "profile.mark_disabled",
            self.profiles.mark_disabled(user_id),
        )
        .await?;
        if !disabled {
            return Err(AppError::TwoFactorNotEnabled);
        }

        self.record(
            user_id,
            AuditEventKind::TwoFactorDisabled,
            AuditOutcome::Success,
            None,
            client,
        );
        tracing::info!(user_id = %user_id, "2FA無効化完了");

        Ok(())
    }

    /// ログイン時の第二要素を検証
    ///
    /// TOTP を先に試し、一致しなければバックアップコードとして消費を試みる
    pub async fn verify_login_factor(
        &self,
        user_id: Uuid,
        candidate: &str,
        client: &ClientContext,
    ) -> Result<LoginFactorOutcome, AppError> {
        let profile = self
            .load_profile(user_id)
            .await?
            .filter(TwoFactorProfile::is_enabled)
            .ok_or(AppError::TwoFactorNotEnabled)?;

        let secret = self.totp.decrypt_secret(&profile.totp_secret_encrypted)?;

        let outcome = if self
            .totp
            .verify_totp(&secret, candidate, self.policy.totp_window)
        {
            LoginFactorOutcome::AcceptedTotp {
                backup_codes: self.ledger.summarize(&profile),
            }
        } else if let Some(backup_codes) = self.ledger.consume(user_id, candidate).await? {
            LoginFactorOutcome::AcceptedBackupCode { backup_codes }
        } else {
            LoginFactorOutcome::Rejected
        };

        match outcome.method() {
            Some(method) => {
                self.record(
                    user_id,
                    AuditEventKind::LoginFactorVerified,
                    AuditOutcome::Success,
                    Some(method),
                    client,
                );
                self.touch_last_verified(user_id).await;
                tracing::info!(user_id = %user_id, method, "2FA検証成功");
            }
            None => {
                self.record(
                    user_id,
                    AuditEventKind::LoginFactorVerified,
                    AuditOutcome::Failure,
                    None,
                    client,
                );
                tracing::warn!(user_id = %user_id, "2FA検証失敗");
            }
        }

        Ok(outcome)
    }

    /// 現在の2FA状態
    pub async fn status(&self, user_id: Uuid) -> Result<TwoFactorStatus, AppError> {
        let Some(profile) = self.load_profile(user_id).await? else {
            return Ok(TwoFactorStatus {
                enabled: false,
                setup_started: false,
                enabled_at: None,
                last_used_at: None,
                backup_codes_remaining: None,
            });
        };

        let enabled = profile.is_enabled();
        Ok(TwoFactorStatus {
            enabled,
            setup_started: profile.state != TwoFactorState::Disabled,
            enabled_at: profile.enabled_at.filter(|_| enabled),
            last_used_at: profile.last_verified_at,
            backup_codes_remaining: enabled.then(|| self.ledger.remaining_count(&profile)),
        })
    }

    /// 設定中の QR コード（PNG）
    pub async fn qr_code(&self, user_id: Uuid, account_label: &str) -> Result<Vec<u8>, AppError> {
        let profile = self
            .load_profile(user_id)
            .await?
            .ok_or(AppError::SetupNotFound)?;

        match profile.state {
            TwoFactorState::PendingVerification => {
                let secret = self.totp.decrypt_secret(&profile.totp_secret_encrypted)?;
                self.totp.qr_code_png(&secret, account_label)
            }
            TwoFactorState::Enabled => Err(AppError::TwoFactorAlreadyEnabled),
            TwoFactorState::Disabled => Err(AppError::SetupNotFound),
        }
    }

    async fn load_profile(&self, user_id: Uuid) -> Result<Option<TwoFactorProfile>, AppError> {
        within(
            self.policy.store_timeout,
            "profile.find_by_user_id",
            self.profiles.find_by_user_id(user_id),
        )
        .await
    }

    async fn touch_last_verified(&self, user_id: Uuid) {
        if let Err(e) = within(
            self.policy.store_timeout,
            "profile.touch_last_verified",
            self.profiles.touch_last_verified(user_id),
        )
        .await
        {
            tracing::warn!(error = %e, user_id = %user_id, "last_verified_at の更新に失敗");
        }
    }

    fn record(
        &self,
        user_id: Uuid,
        kind: AuditEventKind,
        outcome: AuditOutcome,
        detail: Option<&str>,
        client: &ClientContext,
    ) {
        let mut event = AuditEvent::new(user_id, kind, outcome)
            .with_client(client.ip_address.clone(), client.user_agent.clone());
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.audit.record(event);
    }
}
