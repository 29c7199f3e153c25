//! Service admission validators.
//!
//! Before a service is started, every configured [`Validator`] gets a chance
//! to refuse it. The first refusal wins; later validators are not consulted.

pub mod custom_commands;

use std::sync::Arc;

use async_trait::async_trait;

pub use custom_commands::CustomCommandsValidator;

use crate::models::Service;

/// Reasons a validator refuses a service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The service overrides command or entrypoint while the device forbids it.
    #[error("custom commands are disabled on this device")]
    CustomCommandsDisabled,
}

/// An admission check applied to a service before it runs.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Accept or refuse `service`.
    async fn validate(&self, service: &Service) -> Result<(), ValidationError>;

    /// Short name used in logs and rejection reports.
    fn name(&self) -> &str;
}

/// A refusal together with the validator that issued it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rejected by {validator}: {source}")]
pub struct Rejection {
    /// Name of the refusing validator.
    pub validator: String,
    /// Why it refused.
    pub source: ValidationError,
}

/// Run `validators` in order against `service`, stopping at the first refusal.
pub async fn validate_service(
    validators: &[Arc<dyn Validator>],
    service: &Service,
) -> Result<(), Rejection> {
    for validator in validators {
        if let Err(source) = validator.validate(service).await {
            return Err(Rejection {
                validator: validator.name().to_owned(),
                source,
            });
        }
    }
    Ok(())
}
