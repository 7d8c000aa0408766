pub mod audit_event;
pub mod client_context;
pub mod trusted_device;
pub mod two_factor_profile;
pub mod user;

pub use audit_event::{AuditEvent, AuditEventKind, AuditOutcome, StoredAuditEvent};
pub use client_context::ClientContext;
pub use trusted_device::{NewTrustedDevice, TrustedDevice};
pub use two_factor_profile::{TwoFactorProfile, TwoFactorState};
pub use user::User;
