use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AuditEvent, StoredAuditEvent};
use crate::repositories::AuditEventStore;

#[derive(Clone)]
pub struct AuditEventRepository {
    pool: PgPool,
}

impl AuditEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditEventStore for AuditEventRepository {
    async fn insert(&self, event: &AuditEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO two_factor_audit_events
                (id, user_id, event_type, outcome, detail, ip_address, user_agent, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.kind.as_str())
        .bind(event.outcome.as_str())
        .bind(&event.detail)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ユーザーの監査イベントを新しい順に取得
    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoredAuditEvent>, sqlx::Error> {
        sqlx::query_as::<_, StoredAuditEvent>(
            r#"
            SELECT id, user_id, event_type, outcome, detail, ip_address, occurred_at
            FROM two_factor_audit_events
            WHERE user_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
