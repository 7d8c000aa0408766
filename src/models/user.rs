use sqlx::FromRow;
use uuid::Uuid;

/// ディレクトリから同期されたユーザー
///
/// 一次認証は外部IdPが行う。password_hash はローカル資格情報を持つ
/// ユーザーのみ設定され、2FA無効化時の本人確認に使用する
#[derive(Debug, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_active: bool,
}
