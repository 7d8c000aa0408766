use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;

/// 共有シークレットのバイト長（160ビット）
const SECRET_LEN: usize = 20;
const NONCE_LEN: usize = 12;

/// TOTP (Time-based One-Time Password) サービス
///
/// # Security
/// - シークレットはAES-256-GCMで暗号化してDB保存
/// - シークレット平文・コードはログに出力しない
/// - 検証系は不正入力に対して false を返し、エラーにしない
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    encryption_key: [u8; 32],
    digits: usize,
    interval_secs: u64,
}

impl TotpService {
    /// 新しい TotpService を作成
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）
    /// * `encryption_key_base64` - Base64エンコードされた32バイトの暗号化キー
    /// * `digits` - コード桁数（6〜8）
    /// * `interval_secs` - タイムステップ（秒）
    pub fn new(
        issuer: String,
        encryption_key_base64: &str,
        digits: usize,
        interval_secs: u64,
    ) -> Result<Self, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        if !(6..=8).contains(&digits) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "totp digits must be between 6 and 8"
            )));
        }
        if interval_secs == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "totp interval must be positive"
            )));
        }

        let key_bytes = STANDARD.decode(encryption_key_base64).map_err(|e| {
            tracing::error!(error = ?e, "TOTP暗号化キーのBase64デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid encryption key format"))
        })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "TOTP暗号化キーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption key must be 32 bytes"
            )));
        }

        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&key_bytes);

        Ok(Self {
            issuer,
            encryption_key,
            digits,
            interval_secs,
        })
    }

    /// 20バイトのランダムシークレットを生成し、Base32（パディングなし）でエンコード
    pub fn generate_shared_secret() -> String {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        BASE32_NOPAD.encode(&bytes)
    }

    /// シークレットをAES-256-GCMで暗号化
    ///
    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文
    pub fn encrypt_secret(&self, secret: &str) -> Result<Vec<u8>, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// 暗号化されたシークレットを復号
    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<String, AppError> {
        if encrypted.len() < NONCE_LEN {
            tracing::error!(len = encrypted.len(), "暗号化データが短すぎる");
            return Err(AppError::Internal(anyhow::anyhow!(
                "encrypted data too short"
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット復号エラー");
            AppError::Internal(anyhow::anyhow!("decryption error"))
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Internal(anyhow::anyhow!("invalid utf8 after decryption"))
        })
    }

    /// 指定時刻（UNIX秒）のTOTPコードを計算
    ///
    /// シークレットが不正な場合は None
    pub fn compute_totp(&self, secret: &str, timestamp: u64) -> Option<String> {
        self.build_totp(secret, None)
            .map(|totp| totp.generate(timestamp))
    }

    /// 現在時刻でTOTPコードを検証（前後 window ステップを許容）
    pub fn verify_totp(&self, secret: &str, candidate: &str, window: u8) -> bool {
        match u64::try_from(OffsetDateTime::now_utc().unix_timestamp()) {
            Ok(now) => self.verify_totp_at(secret, candidate, window, now),
            Err(_) => false,
        }
    }

    /// 指定時刻でTOTPコードを検証
    ///
    /// # Note
    /// - 空白・ハイフンは除去してから比較
    /// - 桁数が合わない、数字以外を含む場合は false
    /// - 比較は定数時間、一致してもウィンドウ全体を走査する
    pub fn verify_totp_at(&self, secret: &str, candidate: &str, window: u8, timestamp: u64) -> bool {
        let Some(code) = normalize_totp_code(candidate, self.digits) else {
            return false;
        };
        let Some(totp) = self.build_totp(secret, None) else {
            return false;
        };

        let current = (timestamp / self.interval_secs) as i128;
        let window = i128::from(window);
        let mut matched = false;

        for counter in (current - window)..=(current + window) {
            // エポック以前のステップは存在しない
            let Ok(counter) = u64::try_from(counter) else {
                continue;
            };
            let Some(step_time) = counter.checked_mul(self.interval_secs) else {
                continue;
            };
            let expected = totp.generate(step_time);
            matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
        }

        matched
    }

    /// otpauth:// 形式のプロビジョニングURIを生成
    pub fn provisioning_uri(&self, secret: &str, account_label: &str) -> Option<String> {
        self.build_totp(secret, Some(account_label))
            .map(|totp| totp.get_url())
    }

    /// QRコードを生成（PNG形式）
    ///
    /// # Arguments
    /// * `account_label` - 認証アプリに表示されるアカウント名（メールアドレス等）
    /// * `secret` - Base32エンコードされたシークレット
    pub fn qr_code_png(&self, secret: &str, account_label: &str) -> Result<Vec<u8>, AppError> {
        let totp = self.require_totp(secret, account_label)?;

        totp.get_qr_png().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })
    }

    /// QRコードを data URL 形式で生成
    pub fn qr_code_data_url(&self, secret: &str, account_label: &str) -> Result<String, AppError> {
        let totp = self.require_totp(secret, account_label)?;

        let qr_code = totp.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;

        Ok(format!("data:image/png;base64,{}", qr_code))
    }

    fn require_totp(&self, secret: &str, account_label: &str) -> Result<TOTP, AppError> {
        self.build_totp(secret, Some(account_label)).ok_or_else(|| {
            tracing::error!("シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })
    }

    /// TOTP オブジェクトを作成
    ///
    /// # Note
    /// skew は使わない（ウィンドウ判定は verify_totp_at で行う）
    /// 既存の短いシークレット（80ビット）も受け付けるため unchecked で作成
    fn build_totp(&self, secret: &str, account_label: Option<&str>) -> Option<TOTP> {
        let secret_bytes = decode_secret(secret)?;

        Some(TOTP::new_unchecked(
            Algorithm::SHA1,
            self.digits,
            0,
            self.interval_secs,
            secret_bytes,
            account_label.map(|_| self.issuer.clone()),
            account_label.unwrap_or_default().to_string(),
        ))
    }
}

/// Base32シークレットをデコード（大文字小文字・パディング・空白を許容）
fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let bytes = BASE32_NOPAD.decode(normalized.as_bytes()).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Some(bytes)
}

/// 入力コードを正規化（空白・ハイフン除去、桁数と数字のみを確認）
fn normalize_totp_code(candidate: &str, digits: usize) -> Option<String> {
    let code: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    if code.len() != digits || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(code)
}
