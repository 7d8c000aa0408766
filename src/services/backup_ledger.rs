use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{AuditEvent, AuditEventKind, AuditOutcome, ClientContext, TwoFactorProfile};
use crate::repositories::{ProfileStore, within};
use crate::services::audit::AuditSink;
use crate::services::backup_codes::{
    BackupCodeSet, generate_backup_codes, hash_backup_code, normalize_backup_code,
    verify_backup_code,
};

/// バックアップコードの残数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupCodeSummary {
    pub remaining: usize,
    pub total: usize,
    pub low: bool,
}

/// バックアップコードの消費・再発行を管理
#[derive(Clone)]
pub struct BackupCodeLedger {
    profiles: Arc<dyn ProfileStore>,
    audit: Arc<dyn AuditSink>,
    code_count: usize,
    low_threshold: usize,
    deadline: Duration,
}

impl BackupCodeLedger {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        audit: Arc<dyn AuditSink>,
        code_count: usize,
        low_threshold: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            profiles,
            audit,
            code_count,
            low_threshold,
            deadline,
        }
    }

    pub fn code_count(&self) -> usize {
        self.code_count
    }

    /// バックアップコードを使用済みにする
    ///
    /// # Returns
    /// この呼び出しで消費できた場合のみ true
    pub async fn mark_used(&self, user_id: Uuid, candidate: &str) -> Result<bool, AppError> {
        Ok(self.consume(user_id, candidate).await?.is_some())
    }

    /// バックアップコードを消費し、消費後の残数を返す
    ///
    /// # Note
    /// 事前チェック後、ストアの条件付き更新で確定させる
    /// 同じコードを同時に送っても Some になるのは1回だけ
    /// 残数は読み込んだプロファイルから算出し、消費後にストアを再読込しない
    pub async fn consume(
        &self,
        user_id: Uuid,
        candidate: &str,
    ) -> Result<Option<BackupCodeSummary>, AppError> {
        let profile = within(
            self.deadline,
            "profile.find_by_user_id",
            self.profiles.find_by_user_id(user_id),
        )
        .await?;

        let Some(profile) = profile.filter(TwoFactorProfile::is_enabled) else {
            return Ok(None);
        };

        if !verify_backup_code(candidate, &profile.backup_codes_hash) {
            return Ok(None);
        }

        let code_hash = hash_backup_code(&normalize_backup_code(candidate));
        if profile.is_consumed(&code_hash) {
            tracing::warn!(user_id = %user_id, "使用済みバックアップコードの再利用");
            return Ok(None);
        }

        let consumed = within(
            self.deadline,
            "profile.consume_backup_code",
            self.profiles.consume_backup_code(user_id, &code_hash),
        )
        .await?;

        if !consumed {
            tracing::warn!(user_id = %user_id, "バックアップコードの同時使用を検出");
            return Ok(None);
        }

        let remaining = self.remaining_count(&profile).saturating_sub(1);
        tracing::info!(user_id = %user_id, remaining, "バックアップコード使用");

        Ok(Some(BackupCodeSummary {
            remaining,
            total: profile.backup_codes_hash.len(),
            low: self.is_running_low(remaining),
        }))
    }

    /// 未使用のバックアップコード数
    pub fn remaining_count(&self, profile: &TwoFactorProfile) -> usize {
        profile
            .backup_codes_hash
            .iter()
            .filter(|hash| !profile.is_consumed(hash))
            .count()
    }

    pub fn is_running_low(&self, remaining: usize) -> bool {
        remaining <= self.low_threshold
    }

    pub fn summarize(&self, profile: &TwoFactorProfile) -> BackupCodeSummary {
        let remaining = self.remaining_count(profile);
        BackupCodeSummary {
            remaining,
            total: profile.backup_codes_hash.len(),
            low: self.is_running_low(remaining),
        }
    }

    /// 残数を取得
    ///
    /// 2FA未有効のユーザーは残数 0 として扱う
    pub async fn summary(&self, user_id: Uuid) -> Result<BackupCodeSummary, AppError> {
        let profile = within(
            self.deadline,
            "profile.find_by_user_id",
            self.profiles.find_by_user_id(user_id),
        )
        .await?
        .filter(TwoFactorProfile::is_enabled);

        Ok(match profile {
            Some(profile) => self.summarize(&profile),
            None => BackupCodeSummary {
                remaining: 0,
                total: 0,
                low: false,
            },
        })
    }

    /// バックアップコードを再発行
    ///
    /// 以前のコードはすべて無効になる。平文はこの戻り値でのみ返す
    pub async fn regenerate(
        &self,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<BackupCodeSet, AppError> {
        let profile = within(
            self.deadline,
            "profile.find_by_user_id",
            self.profiles.find_by_user_id(user_id),
        )
        .await?;

        if !profile.as_ref().is_some_and(TwoFactorProfile::is_enabled) {
            return Err(AppError::TwoFactorNotEnabled);
        }

        let set = generate_backup_codes(self.code_count);

        let replaced = within(
            self.deadline,
            "profile.replace_backup_codes",
            self.profiles.replace_backup_codes(user_id, &set.hashes),
        )
        .await?;

        // 読み込み後に無効化された
        if !replaced {
            return Err(AppError::TwoFactorNotEnabled);
        }

        self.audit.record(
            AuditEvent::new(
                user_id,
                AuditEventKind::BackupCodesRegenerated,
                AuditOutcome::Success,
            )
            .with_client(client.ip_address.clone(), client.user_agent.clone()),
        );

        tracing::info!(user_id = %user_id, count = set.codes.len(), "バックアップコード再発行");

        Ok(set)
    }
}
