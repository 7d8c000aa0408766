use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{NewTrustedDevice, TrustedDevice};
use crate::repositories::DeviceStore;

#[derive(Clone)]
pub struct TrustedDeviceRepository {
    pool: PgPool,
}

impl TrustedDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for TrustedDeviceRepository {
    /// 信頼済みデバイスを登録
    ///
    /// # Arguments
    /// * `token_hash` - トークンのSHA256ハッシュ（平文は保存しない）
    /// * `expires_at` - 有効期限（作成時に固定）
    async fn insert(
        &self,
        user_id: Uuid,
        device: &NewTrustedDevice,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<TrustedDevice, sqlx::Error> {
        sqlx::query_as::<_, TrustedDevice>(
            r#"
            INSERT INTO trusted_devices
                (device_id, user_id, device_name, device_fingerprint, token_hash,
                 ip_address, user_agent, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING device_id, user_id, device_name, device_fingerprint, token_hash,
                      ip_address, user_agent, created_at, last_used_at, expires_at, is_active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&device.device_name)
        .bind(&device.device_fingerprint)
        .bind(token_hash)
        .bind(&device.ip_address)
        .bind(&device.user_agent)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
    }

    /// トークンハッシュで有効なデバイスを検索
    ///
    /// # Note
    /// 有効期限の検証は呼び出し側で行う
    async fn find_active_by_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device_fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, sqlx::Error> {
        sqlx::query_as::<_, TrustedDevice>(
            r#"
            SELECT device_id, user_id, device_name, device_fingerprint, token_hash,
                   ip_address, user_agent, created_at, last_used_at, expires_at, is_active
            FROM trusted_devices
            WHERE token_hash = $1
              AND user_id = $2
              AND device_fingerprint = $3
              AND is_active = TRUE
            "#,
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(device_fingerprint)
        .fetch_optional(&self.pool)
        .await
    }

    async fn touch_last_used(
        &self,
        device_id: Uuid,
        used_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trusted_devices
            SET last_used_at = $2
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .bind(used_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_for_user(
        &self,
        device_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TrustedDevice>, sqlx::Error> {
        sqlx::query_as::<_, TrustedDevice>(
            r#"
            SELECT device_id, user_id, device_name, device_fingerprint, token_hash,
                   ip_address, user_agent, created_at, last_used_at, expires_at, is_active
            FROM trusted_devices
            WHERE device_id = $1 AND user_id = $2
            "#,
        )
        .bind(device_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// デバイスを失効（行は削除しない）
    async fn deactivate(&self, device_id: Uuid, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trusted_devices
            SET is_active = FALSE
            WHERE device_id = $1 AND user_id = $2
            "#,
        )
        .bind(device_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ユーザーの全デバイスを失効
    ///
    /// # Returns
    /// 失効した行数
    async fn deactivate_all_for_user(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE trusted_devices
            SET is_active = FALSE
            WHERE user_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<TrustedDevice>, sqlx::Error> {
        sqlx::query_as::<_, TrustedDevice>(
            r#"
            SELECT device_id, user_id, device_name, device_fingerprint, token_hash,
                   ip_address, user_agent, created_at, last_used_at, expires_at, is_active
            FROM trusted_devices
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY last_used_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }
}
