use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    /// 起動時にマイグレーションを適用するか
    #[serde(default)]
    pub run_migrations: bool,
    /// ストア呼び出しのデッドライン（ミリ秒）
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    #[serde(default = "default_totp_digits")]
    pub totp_digits: usize,
    #[serde(default = "default_totp_interval_secs")]
    pub totp_interval_secs: u64,
    /// 前後何ステップまで許容するか
    #[serde(default = "default_totp_window")]
    pub totp_window: u8,

    // バックアップコード設定
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
    /// 残数がこの値以下になったら警告
    #[serde(default = "default_backup_code_low_threshold")]
    pub backup_code_low_threshold: usize,

    // 信頼済みデバイス設定
    #[serde(default = "default_trusted_device_ttl_days")]
    pub trusted_device_ttl_days: i64,

    /// 監査イベントを DB に保存するか（false ならログ出力のみ）
    #[serde(default = "default_persist_audit_events")]
    pub persist_audit_events: bool,

    /// CORS許可オリジン（カンマ区切り、未設定なら CORS 無効）
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_TOTP_DIGITS: usize = 6;
const DEFAULT_TOTP_INTERVAL_SECS: u64 = 30;
const DEFAULT_TOTP_WINDOW: u8 = 1;
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_BACKUP_CODE_LOW_THRESHOLD: usize = 2;
const DEFAULT_TRUSTED_DEVICE_TTL_DAYS: i64 = 30;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_database_max_connections() -> u32 {
    DEFAULT_DATABASE_MAX_CONNECTIONS
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_totp_digits() -> usize {
    DEFAULT_TOTP_DIGITS
}

fn default_totp_interval_secs() -> u64 {
    DEFAULT_TOTP_INTERVAL_SECS
}

fn default_totp_window() -> u8 {
    DEFAULT_TOTP_WINDOW
}

fn default_backup_code_count() -> usize {
    DEFAULT_BACKUP_CODE_COUNT
}

fn default_backup_code_low_threshold() -> usize {
    DEFAULT_BACKUP_CODE_LOW_THRESHOLD
}

fn default_trusted_device_ttl_days() -> i64 {
    DEFAULT_TRUSTED_DEVICE_TTL_DAYS
}

fn default_persist_audit_events() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// ストア呼び出しのデッドライン
    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }

    /// 信頼済みデバイスの有効期間
    pub fn trusted_device_ttl(&self) -> time::Duration {
        time::Duration::days(self.trusted_device_ttl_days)
    }

    /// CORS許可オリジンの一覧
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
