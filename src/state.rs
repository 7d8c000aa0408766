use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::{
    AuditEventRepository, AuditEventStore, DeviceStore, ProfileStore, TrustedDeviceRepository,
    TwoFactorProfileRepository, UserRepository,
};
use crate::services::audit::{AuditSink, PgAuditSink, TracingAuditSink};
use crate::services::enrollment::EnrollmentPolicy;
use crate::services::{
    AuthService, BackupCodeLedger, CredentialVerifier, EnrollmentService, TotpService,
    TrustedDeviceRegistry,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// 登録・検証・無効化
    pub enrollment: EnrollmentService,
    /// バックアップコード
    pub ledger: BackupCodeLedger,
    /// 信頼済みデバイス
    pub devices: TrustedDeviceRegistry,
    /// 監査イベント（一覧表示用）
    pub audit_events: Arc<dyn AuditEventStore>,
}

/// 状態の構築に必要なストア・外部依存
pub struct StateParts {
    pub profiles: Arc<dyn ProfileStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub audit_events: Arc<dyn AuditEventStore>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub audit_sink: Arc<dyn AuditSink>,
}

impl AppState {
    /// PostgreSQL をストアとして AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let audit_events: Arc<dyn AuditEventStore> =
            Arc::new(AuditEventRepository::new(db_pool.clone()));
        let credentials = Arc::new(AuthService::new(
            UserRepository::new(db_pool.clone()),
            config.store_timeout(),
        ));
        let audit_sink = audit_sink(&config, audit_events.clone());

        Self::from_parts(
            config,
            StateParts {
                profiles: Arc::new(TwoFactorProfileRepository::new(db_pool.clone())),
                devices: Arc::new(TrustedDeviceRepository::new(db_pool)),
                audit_sink,
                audit_events,
                credentials,
            },
        )
    }

    /// 各サービスを組み立てる
    pub fn from_parts(config: Config, parts: StateParts) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let store_timeout = config.store_timeout();

        let totp = TotpService::new(
            config.totp_issuer.clone(),
            config.encryption_key.expose_secret(),
            config.totp_digits,
            config.totp_interval_secs,
        )?;

        let ledger = BackupCodeLedger::new(
            parts.profiles.clone(),
            parts.audit_sink.clone(),
            config.backup_code_count,
            config.backup_code_low_threshold,
            store_timeout,
        );

        let devices = TrustedDeviceRegistry::new(
            parts.devices,
            parts.audit_sink.clone(),
            config.trusted_device_ttl(),
            store_timeout,
        );

        let enrollment = EnrollmentService::new(
            parts.profiles,
            totp,
            ledger.clone(),
            devices.clone(),
            parts.credentials,
            parts.audit_sink,
            EnrollmentPolicy {
                totp_window: config.totp_window,
                store_timeout,
            },
        );

        Ok(Self {
            config,
            enrollment,
            ledger,
            devices,
            audit_events: parts.audit_events,
        })
    }
}

/// 監査シンクを選択
///
/// 保存無効時は tracing 出力のみ（一覧 API は空になる）
fn audit_sink(config: &Config, store: Arc<dyn AuditEventStore>) -> Arc<dyn AuditSink> {
    if config.persist_audit_events {
        Arc::new(PgAuditSink::new(store))
    } else {
        tracing::info!("監査イベントの保存は無効（ログ出力のみ）");
        Arc::new(TracingAuditSink)
    }
}
