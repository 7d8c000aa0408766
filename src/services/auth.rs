use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::repositories::{UserRepository, within};

/// タイミング攻撃対策用のダミーハッシュ
///
/// Argon2::default() と同じパラメータ（m=19456, t=2, p=1）。照合は常に失敗する
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$XHMNxOKJe84Vi+WRUnuXhg$cuLmLZPofqP/yGvwwA9G3taNs5nbW4orligU8t6V4JE";

/// 2FA無効化時のパスワード再確認
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError>;
}

/// ローカル資格情報（argon2id）によるパスワード確認
#[derive(Clone)]
pub struct AuthService {
    user_repo: UserRepository,
    deadline: Duration,
}

impl AuthService {
    /// 新しい AuthService を作成
    pub fn new(user_repo: UserRepository, deadline: Duration) -> Self {
        Self {
            user_repo,
            deadline,
        }
    }
}

#[async_trait]
impl CredentialVerifier for AuthService {
    /// パスワードを検証
    ///
    /// タイミング攻撃対策: ユーザー不在・パスワード未設定の場合もダミー検証を実行
    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError> {
        let user = within(
            self.deadline,
            "user.find_by_id",
            self.user_repo.find_by_id(user_id),
        )
        .await?;

        let password_hash = match user.as_ref() {
            Some(user) if user.is_active => user.password_hash.as_deref(),
            _ => None,
        };

        match password_hash {
            Some(hash) => {
                let verified = check_password(password, hash)?;
                if !verified {
                    tracing::warn!(user_id = %user_id, "パスワード確認失敗");
                }
                Ok(verified)
            }
            None => {
                check_password(password, DUMMY_HASH)?;
                tracing::warn!(user_id = %user_id, "パスワード確認失敗: ローカル資格情報なし");
                Ok(false)
            }
        }
    }
}

/// argon2 ハッシュと照合
fn check_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| {
        tracing::error!(error = ?e, "パスワードハッシュのパースエラー");
        AppError::Internal(anyhow::anyhow!("password hash parse error"))
    })?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// テスト用：固定パスワードを受け付ける
#[cfg(test)]
pub struct StaticCredentials {
    pub password: Option<String>,
}

#[cfg(test)]
#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify_password(&self, _user_id: Uuid, password: &str) -> Result<bool, AppError> {
        Ok(self.password.as_deref() == Some(password))
    }
}
