//! Device policy variables.
//!
//! Six independent policy values live as files in one directory. Two are
//! presence markers (the file existing means "true"), four carry content.
//! [`FsVariables`] keeps them current with a filesystem watcher; consumers
//! depend on the [`Variables`] trait.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

pub mod authorized_keys;
pub mod fs;

pub use authorized_keys::{parse_authorized_keys, AuthorizedKey, AuthorizedKeysError};
pub use fs::{FsVariables, PolicySnapshot};

/// The six policy values and their on-disk file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyField {
    /// Presence marker: disable the device SSH endpoint.
    DisableSsh,
    /// OpenSSH `authorized_keys` content.
    AuthorizedSshKeys,
    /// Host key material for the SSH endpoint.
    HostSignerKey,
    /// Registry credentials used for image pulls.
    RegistryAuth,
    /// Newline-separated image allow-list.
    WhitelistedImages,
    /// Presence marker: refuse services with command/entrypoint overrides.
    DisableCustomCommands,
}

impl PolicyField {
    /// Every field, in refresh order.
    pub const ALL: [PolicyField; 6] = [
        PolicyField::DisableSsh,
        PolicyField::AuthorizedSshKeys,
        PolicyField::HostSignerKey,
        PolicyField::RegistryAuth,
        PolicyField::WhitelistedImages,
        PolicyField::DisableCustomCommands,
    ];

    /// File name of this field inside the policy directory.
    pub fn file_name(self) -> &'static str {
        match self {
            PolicyField::DisableSsh => "disable-ssh",
            PolicyField::AuthorizedSshKeys => "authorized-ssh-keys",
            PolicyField::HostSignerKey => "host-signer-key",
            PolicyField::RegistryAuth => "registry-auth",
            PolicyField::WhitelistedImages => "whitelisted-images",
            PolicyField::DisableCustomCommands => "disable-custom-commands",
        }
    }
}

impl fmt::Display for PolicyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Errors produced while watching or refreshing the policy directory.
#[derive(Debug, thiserror::Error)]
pub enum VariablesError {
    /// The directory watch could not be established.
    #[error("failed to watch policy directory: {0}")]
    Watch(#[from] notify::Error),

    /// Reading a field's file failed for a reason other than absence.
    #[error("failed to read {field} at {}: {source}", path.display())]
    Io {
        /// Field being refreshed.
        field: PolicyField,
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A field's content could not be parsed.
    #[error("failed to parse {field}: {source}")]
    Parse {
        /// Field being refreshed.
        field: PolicyField,
        /// Underlying parse error.
        source: AuthorizedKeysError,
    },
}

impl VariablesError {
    /// The field this error belongs to, if any.
    pub fn field(&self) -> Option<PolicyField> {
        match self {
            VariablesError::Watch(_) => None,
            VariablesError::Io { field, .. } | VariablesError::Parse { field, .. } => Some(*field),
        }
    }
}

/// Read access to device policy.
///
/// Every accessor waits until its field has loaded at least once, then
/// returns an owned snapshot of the current value.
#[async_trait]
pub trait Variables: Send + Sync {
    /// Whether the SSH endpoint is disabled.
    async fn disable_ssh(&self) -> bool;
    /// Public keys allowed to open SSH sessions.
    async fn authorized_ssh_keys(&self) -> Vec<AuthorizedKey>;
    /// Host key material (empty when unset).
    async fn host_signer_key(&self) -> String;
    /// Registry auth blob (empty when unset).
    async fn registry_auth(&self) -> String;
    /// Allowed image references.
    async fn whitelisted_images(&self) -> Vec<String>;
    /// Whether command/entrypoint overrides are refused.
    async fn disable_custom_commands(&self) -> bool;
}
