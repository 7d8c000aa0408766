use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::TwoFactorProfile;
use crate::repositories::ProfileStore;

#[derive(Clone)]
pub struct TwoFactorProfileRepository {
    pool: PgPool,
}

impl TwoFactorProfileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for TwoFactorProfileRepository {
    /// ユーザーIDで2FAプロファイルを検索
    async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<TwoFactorProfile>, sqlx::Error> {
        sqlx::query_as::<_, TwoFactorProfile>(
            r#"
            SELECT user_id, totp_secret_encrypted, state, backup_codes_hash,
                   backup_codes_used, created_at, enabled_at, last_verified_at
            FROM user_two_factor
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 登録試行を保存
    ///
    /// # Note
    /// 単一の upsert で secret とバックアップコードを同時に置き換える
    /// Enabled の行は WHERE 条件により更新されず、RETURNING が空になる
    async fn upsert_pending(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<TwoFactorProfile>, sqlx::Error> {
        sqlx::query_as::<_, TwoFactorProfile>(
            r#"
            INSERT INTO user_two_factor
                (user_id, totp_secret_encrypted, state, backup_codes_hash, backup_codes_used)
            VALUES ($1, $2, 'pending_verification', $3, '{}')
            ON CONFLICT (user_id) DO UPDATE
            SET totp_secret_encrypted = EXCLUDED.totp_secret_encrypted,
                state = 'pending_verification',
                backup_codes_hash = EXCLUDED.backup_codes_hash,
                backup_codes_used = '{}',
                created_at = NOW(),
                enabled_at = NULL,
                last_verified_at = NULL
            WHERE user_two_factor.state <> 'enabled'
            RETURNING user_id, totp_secret_encrypted, state, backup_codes_hash,
                      backup_codes_used, created_at, enabled_at, last_verified_at
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .bind(backup_code_hashes)
        .fetch_optional(&self.pool)
        .await
    }

    /// 2FAを有効化
    ///
    /// # Note
    /// 読み込み後に登録がやり直された場合、secret が一致せず更新されない
    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<Option<OffsetDateTime>, sqlx::Error> {
        sqlx::query_scalar::<_, OffsetDateTime>(
            r#"
            UPDATE user_two_factor
            SET state = 'enabled', enabled_at = NOW()
            WHERE user_id = $1
              AND state = 'pending_verification'
              AND totp_secret_encrypted = $2
            RETURNING enabled_at
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .fetch_optional(&self.pool)
        .await
    }

    /// 2FAを無効化
    async fn mark_disabled(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_two_factor
            SET state = 'disabled'
            WHERE user_id = $1 AND state = 'enabled'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_last_verified(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_two_factor
            SET last_verified_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// バックアップコードを使用済みにマーク
    ///
    /// # Note
    /// 存在確認・未使用確認・追記を1つの UPDATE で行う
    /// 同一コードの同時リクエストは行ロック後の再評価で片方のみ成功する
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_two_factor
            SET backup_codes_used = array_append(backup_codes_used, $2)
            WHERE user_id = $1
              AND state = 'enabled'
              AND $2 = ANY(backup_codes_hash)
              AND NOT ($2 = ANY(backup_codes_used))
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        backup_code_hashes: &[String],
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_two_factor
            SET backup_codes_hash = $2, backup_codes_used = '{}'
            WHERE user_id = $1 AND state = 'enabled'
            "#,
        )
        .bind(user_id)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
