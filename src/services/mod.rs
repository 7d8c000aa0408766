pub mod audit;
pub mod auth;
pub mod backup_codes;
pub mod backup_ledger;
pub mod enrollment;
pub mod totp;
pub mod trusted_device;

pub use audit::{AuditSink, PgAuditSink, TracingAuditSink};
pub use auth::{AuthService, CredentialVerifier};
pub use backup_ledger::BackupCodeLedger;
pub use enrollment::EnrollmentService;
pub use totp::TotpService;
pub use trusted_device::TrustedDeviceRegistry;
