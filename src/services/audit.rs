use std::sync::Arc;

use crate::models::{AuditEvent, AuditOutcome};
use crate::repositories::AuditEventStore;

/// 監査イベントの送信先
///
/// 送信は投げっぱなし。失敗しても呼び出し元の処理結果は変わらない
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// tracing の構造化ログ（target = "audit"）に出力するシンク
#[derive(Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        emit_trace(&event);
    }
}

/// tracing 出力後、ストアに非同期で書き込むシンク
#[derive(Clone)]
pub struct PgAuditSink {
    store: Arc<dyn AuditEventStore>,
}

impl PgAuditSink {
    pub fn new(store: Arc<dyn AuditEventStore>) -> Self {
        Self { store }
    }
}

impl AuditSink for PgAuditSink {
    fn record(&self, event: AuditEvent) {
        emit_trace(&event);

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert(&event).await {
                tracing::error!(
                    error = %e,
                    event_id = %event.id,
                    event_type = event.kind.as_str(),
                    "監査イベントの保存に失敗"
                );
            }
        });
    }
}

fn emit_trace(event: &AuditEvent) {
    match event.outcome {
        AuditOutcome::Success => tracing::info!(
            target: "audit",
            event_id = %event.id,
            user_id = %event.user_id,
            event_type = event.kind.as_str(),
            outcome = event.outcome.as_str(),
            detail = event.detail.as_deref(),
            ip_address = event.ip_address.as_deref(),
            "2FA監査イベント"
        ),
        AuditOutcome::Failure => tracing::warn!(
            target: "audit",
            event_id = %event.id,
            user_id = %event.user_id,
            event_type = event.kind.as_str(),
            outcome = event.outcome.as_str(),
            detail = event.detail.as_deref(),
            ip_address = event.ip_address.as_deref(),
            "2FA監査イベント"
        ),
    }
}

/// テスト用：受け取ったイベントを保持するシンク
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingAuditSink {
    events: Arc<std::sync::Mutex<Vec<AuditEvent>>>,
}

#[cfg(test)]
impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: crate::models::AuditEventKind, outcome: AuditOutcome) -> usize {
        self.events()
            .iter()
            .filter(|e| e.kind == kind && e.outcome == outcome)
            .count()
    }
}

#[cfg(test)]
impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
