use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::{Capability, has_capability};
use crate::error::AppError;
use crate::extractors::AuthenticatedUser;
use crate::models::StoredAuditEvent;
use crate::repositories::{AuditEventStore, within};
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditListResponse {
    pub events: Vec<StoredAuditEvent>,
}

/// GET /api/2fa/audit
///
/// 2FA監査イベント一覧（新しい順）
///
/// 他ユーザー分の閲覧には ViewSecurityAudit が必要
pub async fn list_audit_events(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditListResponse>, AppError> {
    let target = query.user_id.unwrap_or(user.user_id);
    let capability = if target == user.user_id {
        Capability::ManageOwnTwoFactor
    } else {
        Capability::ViewSecurityAudit
    };

    if !has_capability(&user, capability) {
        tracing::warn!(
            user_id = %user.user_id,
            target_user_id = %target,
            "監査ログ閲覧権限なし"
        );
        return Err(AppError::Forbidden);
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let events = within(
        state.config.store_timeout(),
        "audit.list_for_user",
        state.audit_events.list_for_user(target, limit),
    )
    .await?;

    Ok(Json(AuditListResponse { events }))
}
