//! Tests for `src/validator/`: the custom-commands policy and validator
//! ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use fleet_agent::models::Service;
use fleet_agent::validator::{
    validate_service, CustomCommandsValidator, ValidationError, Validator,
};
use fleet_agent::variables::{AuthorizedKey, Variables};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Policy with a fixed custom-commands flag and everything else empty.
struct FixedPolicy {
    disable_custom_commands: bool,
}

#[async_trait]
impl Variables for FixedPolicy {
    async fn disable_ssh(&self) -> bool {
        false
    }

    async fn authorized_ssh_keys(&self) -> Vec<AuthorizedKey> {
        Vec::new()
    }

    async fn host_signer_key(&self) -> String {
        String::new()
    }

    async fn registry_auth(&self) -> String {
        String::new()
    }

    async fn whitelisted_images(&self) -> Vec<String> {
        Vec::new()
    }

    async fn disable_custom_commands(&self) -> bool {
        self.disable_custom_commands
    }
}

/// Accepts everything and counts how often it was asked.
#[derive(Default)]
struct CountingValidator {
    calls: AtomicUsize,
}

#[async_trait]
impl Validator for CountingValidator {
    async fn validate(&self, _service: &Service) -> Result<(), ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

fn validator(disable_custom_commands: bool) -> CustomCommandsValidator {
    CustomCommandsValidator::new(Arc::new(FixedPolicy {
        disable_custom_commands,
    }))
}

fn service(command: &[&str], entrypoint: &[&str]) -> Service {
    Service {
        image: "busybox:1.36".to_owned(),
        command: command.iter().map(|s| (*s).to_owned()).collect(),
        entrypoint: entrypoint.iter().map(|s| (*s).to_owned()).collect(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// CustomCommandsValidator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn command_override_rejected_when_disabled() {
    let result = validator(true)
        .validate(&service(&["sh", "-c", "id"], &[]))
        .await;
    assert_eq!(result, Err(ValidationError::CustomCommandsDisabled));
}

#[tokio::test]
async fn entrypoint_override_rejected_when_disabled() {
    let result = validator(true)
        .validate(&service(&[], &["/bin/sh"]))
        .await;
    assert_eq!(result, Err(ValidationError::CustomCommandsDisabled));
}

#[tokio::test]
async fn image_defaults_accepted_when_disabled() {
    assert_eq!(validator(true).validate(&service(&[], &[])).await, Ok(()));
}

#[tokio::test]
async fn overrides_accepted_when_allowed() {
    let result = validator(false)
        .validate(&service(&["sleep", "1"], &["/bin/sh"]))
        .await;
    assert_eq!(result, Ok(()));
}

#[test]
fn rejection_message_is_stable() {
    assert_eq!(
        ValidationError::CustomCommandsDisabled.to_string(),
        "custom commands are disabled on this device"
    );
}

// ---------------------------------------------------------------------------
// validate_service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_refusal_stops_the_chain() {
    let before = Arc::new(CountingValidator::default());
    let after = Arc::new(CountingValidator::default());
    let validators: Vec<Arc<dyn Validator>> = vec![
        Arc::clone(&before) as Arc<dyn Validator>,
        Arc::new(validator(true)),
        Arc::clone(&after) as Arc<dyn Validator>,
    ];

    let rejection = validate_service(&validators, &service(&["id"], &[]))
        .await
        .expect_err("custom command should be refused");

    assert_eq!(rejection.validator, "custom-commands");
    assert_eq!(rejection.source, ValidationError::CustomCommandsDisabled);
    assert_eq!(before.calls.load(Ordering::SeqCst), 1);
    assert_eq!(after.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_chain_accepts() {
    let validators: Vec<Arc<dyn Validator>> = Vec::new();
    assert_eq!(validate_service(&validators, &service(&["id"], &[])).await, Ok(()));
}
