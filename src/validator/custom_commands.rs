//! Refuses command and entrypoint overrides when device policy forbids them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ValidationError, Validator};
use crate::models::Service;
use crate::variables::Variables;

/// Rejects services that override `command` or `entrypoint` while the
/// `disable-custom-commands` policy is set.
pub struct CustomCommandsValidator {
    variables: Arc<dyn Variables>,
}

impl CustomCommandsValidator {
    /// Build a validator reading the policy from `variables`.
    pub fn new(variables: Arc<dyn Variables>) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl Validator for CustomCommandsValidator {
    async fn validate(&self, service: &Service) -> Result<(), ValidationError> {
        let overrides = !service.command.is_empty() || !service.entrypoint.is_empty();
        if !overrides {
            return Ok(());
        }

        // Policy is only consulted when it can matter.
        if self.variables.disable_custom_commands().await {
            debug!(image = %service.image, "refusing custom command");
            return Err(ValidationError::CustomCommandsDisabled);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "custom-commands"
    }
}
