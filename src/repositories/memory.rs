//! テスト用インメモリストア
//!
//! 1つの Mutex 内で check-and-set を行い、Postgres 実装の条件付き UPDATE と
//! 同じ原子性を再現する。障害注入（応答不能・遅延）に対応。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    AuditEvent, NewTrustedDevice, StoredAuditEvent, TrustedDevice, TwoFactorProfile,
    TwoFactorState,
};
use crate::repositories::{AuditEventStore, DeviceStore, ProfileStore};

#[derive(Default)]
struct Inner {
    profiles: HashMap<Uuid, TwoFactorProfile>,
    devices: HashMap<Uuid, TrustedDevice>,
    audit_events: Vec<StoredAuditEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    device_inserts_failing: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以降の呼び出しをすべて失敗させる
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// デバイス登録だけを失敗させる
    pub fn set_device_inserts_failing(&self, failing: bool) {
        self.device_inserts_failing.store(failing, Ordering::SeqCst);
    }

    /// 以降の呼び出しに遅延を入れる
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// テストから期限などを直接書き換える
    pub async fn update_device<F>(&self, device_id: Uuid, f: F)
    where
        F: FnOnce(&mut TrustedDevice),
    {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(&device_id) {
            f(device);
        }
    }

    pub async fn device(&self, device_id: Uuid) -> Option<TrustedDevice> {
        self.inner.lock().await.devices.get(&device_id).cloned()
    }

    async fn gate(&self) -> Result<(), sqlx::Error> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<TwoFactorProfile>, sqlx::Error> {
        self.gate().await?;
        Ok(self.inner.lock().await.profiles.get(&user_id).cloned())
    }

    async fn upsert_pending(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<TwoFactorProfile>, sqlx::Error> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        if inner
            .profiles
            .get(&user_id)
            .is_some_and(|profile| profile.is_enabled())
        {
            return Ok(None);
        }

        let profile = TwoFactorProfile {
            user_id,
            totp_secret_encrypted: secret_encrypted.to_vec(),
            state: TwoFactorState::PendingVerification,
            backup_codes_hash: backup_code_hashes.to_vec(),
            backup_codes_used: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
            enabled_at: None,
            last_verified_at: None,
        };
        inner.profiles.insert(user_id, profile.clone());
        Ok(Some(profile))
    }

    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<Option<OffsetDateTime>, sqlx::Error> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        match inner.profiles.get_mut(&user_id) {
            Some(profile)
                if profile.is_pending() && profile.totp_secret_encrypted == secret_encrypted =>
            {
                let now = OffsetDateTime::now_utc();
                profile.state = TwoFactorState::Enabled;
                profile.enabled_at = Some(now);
                Ok(Some(now))
            }
            _ => Ok(None),
        }
    }

    async fn mark_disabled(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        match inner.profiles.get_mut(&user_id) {
            Some(profile) if profile.is_enabled() => {
                profile.state = TwoFactorState::Disabled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_last_verified(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        self.gate().await?;
        if let Some(profile) = self.inner.lock().await.profiles.get_mut(&user_id) {
            profile.last_verified_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        let Some(profile) = inner.profiles.get_mut(&user_id) else {
            return Ok(false);
        };
        let issued = profile.backup_codes_hash.iter().any(|h| h == code_hash);
        if !profile.is_enabled() || !issued || profile.is_consumed(code_hash) {
            return Ok(false);
        }
        profile.backup_codes_used.push(code_hash.to_string());
        Ok(true)
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        backup_code_hashes: &[String],
    ) -> Result<bool, sqlx::Error> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        match inner.profiles.get_mut(&user_id) {
            Some(profile) if profile.is_enabled() => {
                profile.backup_codes_hash = backup_code_hashes.to_vec();
                profile.backup_codes_used.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert(
        &self,
        user_id: Uuid,
        device: &NewTrustedDevice,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<TrustedDevice, sqlx::Error> {
        self.gate().await?;
        if self.device_inserts_failing.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        let now = OffsetDateTime::now_utc();
        let row = TrustedDevice {
            device_id: Uuid::new_v4(),
            user_id,
            device_name: device.device_name.clone(),
            device_fingerprint: device.device_fingerprint.clone(),
            token_hash: token_hash.to_string(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            created_at: now,
            last_used_at: now,
            expires_at,
            is_active: true,
        };
        self.inner
            .lock()
            .await
            .devices
            .insert(row.device_id, row.clone());
        Ok(row)
    }

    async fn find_active_by_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device_fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, sqlx::Error> {
        self.gate().await?;
        Ok(self
            .inner
            .lock()
            .await
            .devices
            .values()
            .find(|d| {
                d.user_id == user_id
                    && d.token_hash == token_hash
                    && d.device_fingerprint == device_fingerprint
                    && d.is_active
            })
            .cloned())
    }

    async fn touch_last_used(
        &self,
        device_id: Uuid,
        used_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.gate().await?;
        if let Some(device) = self.inner.lock().await.devices.get_mut(&device_id) {
            device.last_used_at = used_at;
        }
        Ok(())
    }

    async fn find_for_user(
        &self,
        device_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TrustedDevice>, sqlx::Error> {
        self.gate().await?;
        Ok(self
            .inner
            .lock()
            .await
            .devices
            .get(&device_id)
            .filter(|d| d.user_id == user_id)
            .cloned())
    }

    async fn deactivate(&self, device_id: Uuid, user_id: Uuid) -> Result<(), sqlx::Error> {
        self.gate().await?;
        if let Some(device) = self.inner.lock().await.devices.get_mut(&device_id)
            && device.user_id == user_id
        {
            device.is_active = false;
        }
        Ok(())
    }

    async fn deactivate_all_for_user(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        self.gate().await?;
        let mut count = 0;
        for device in self.inner.lock().await.devices.values_mut() {
            if device.user_id == user_id && device.is_active {
                device.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<TrustedDevice>, sqlx::Error> {
        self.gate().await?;
        let mut devices: Vec<TrustedDevice> = self
            .inner
            .lock()
            .await
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.is_active)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(devices)
    }
}

#[async_trait]
impl AuditEventStore for MemoryStore {
    async fn insert(&self, event: &AuditEvent) -> Result<(), sqlx::Error> {
        self.gate().await?;
        self.inner.lock().await.audit_events.push(StoredAuditEvent {
            id: event.id,
            user_id: event.user_id,
            event_type: event.kind.as_str().to_string(),
            outcome: event.outcome.as_str().to_string(),
            detail: event.detail.clone(),
            ip_address: event.ip_address.clone(),
            occurred_at: event.occurred_at,
        });
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoredAuditEvent>, sqlx::Error> {
        self.gate().await?;
        let mut events: Vec<StoredAuditEvent> = self
            .inner
            .lock()
            .await
            .audit_events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }
}
