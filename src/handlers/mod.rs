pub mod audit;
pub mod devices;
pub mod health;
pub mod two_factor;

use garde::Validate;

use crate::error::AppError;

pub use audit::list_audit_events;
pub use devices::{list_devices, revoke_device, verify_device};
pub use health::health_check;
pub use two_factor::{
    disable_2fa, enable_2fa, generate_backup_codes, qr_code, remaining_backup_codes, status,
    verify_2fa, verify_setup,
};

/// リクエストDTOのバリデーション
pub(crate) fn validate_request<T>(request: &T) -> Result<(), AppError>
where
    T: Validate,
    T::Context: Default,
{
    request.validate().map_err(|report| {
        tracing::debug!(error = %report, "リクエストのバリデーションエラー");
        AppError::Validation(report.to_string())
    })
}
