//! Filesystem-backed policy store with hot reload.
//!
//! [`FsVariables::start`] watches the policy directory with [`notify`] and
//! re-reads every field on each change event. Fields refresh independently:
//! one unreadable or malformed file leaves the other five untouched.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use super::authorized_keys::{parse_authorized_keys, AuthorizedKey};
use super::{PolicyField, Variables, VariablesError};

/// Default interval at which blocked accessors re-check their field.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest accepted poll interval; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A policy value plus whether it has loaded at least once.
#[derive(Debug, Clone, Default)]
struct Tracked<T> {
    value: T,
    loaded: bool,
}

impl<T: Clone> Tracked<T> {
    fn set(&mut self, value: T) {
        self.value = value;
        self.loaded = true;
    }

    fn get(&self) -> Option<T> {
        self.loaded.then(|| self.value.clone())
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    disable_ssh: Tracked<bool>,
    authorized_ssh_keys: Tracked<Vec<AuthorizedKey>>,
    host_signer_key: Tracked<String>,
    registry_auth: Tracked<String>,
    whitelisted_images: Tracked<Vec<String>>,
    disable_custom_commands: Tracked<bool>,
}

/// Non-blocking view of every field; `None` means not loaded yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySnapshot {
    /// SSH endpoint disabled.
    pub disable_ssh: Option<bool>,
    /// Authorized SSH keys.
    pub authorized_ssh_keys: Option<Vec<AuthorizedKey>>,
    /// Host signer key material.
    pub host_signer_key: Option<String>,
    /// Registry auth blob.
    pub registry_auth: Option<String>,
    /// Image allow-list.
    pub whitelisted_images: Option<Vec<String>>,
    /// Custom commands disabled.
    pub disable_custom_commands: Option<bool>,
}

/// Policy store reading one file per field from a directory.
pub struct FsVariables {
    dir: PathBuf,
    poll_interval: Duration,
    state: RwLock<PolicyState>,
    /// Watcher handle; dropping it ends the refresh thread.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for FsVariables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsVariables")
            .field("dir", &self.dir)
            .field("poll_interval", &self.poll_interval)
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl FsVariables {
    /// Create a store for `dir`. Nothing is read until [`refresh`](Self::refresh)
    /// or [`start`](Self::start).
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_poll_interval(dir, DEFAULT_POLL_INTERVAL)
    }

    /// Create a store whose blocked accessors re-check every `poll_interval`
    /// (at least one millisecond).
    pub fn with_poll_interval(dir: impl Into<PathBuf>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            state: RwLock::new(PolicyState::default()),
            watcher: Mutex::new(None),
        })
    }

    /// Directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Watch the directory, refresh once synchronously, then refresh on every
    /// change event from a background thread.
    ///
    /// Calling `start` on an already-started store replaces the watcher. The
    /// thread only holds a weak reference, so dropping the last handle to the
    /// store stops the watch as well.
    ///
    /// # Errors
    ///
    /// Returns [`VariablesError::Watch`] if the watcher cannot be created or
    /// the directory cannot be watched.
    pub fn start(self: &Arc<Self>) -> Result<(), VariablesError> {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if tx.send(event).is_err() {
                    debug!("policy watcher channel closed");
                }
            })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        self.refresh();

        let variables: Weak<Self> = Arc::downgrade(self);
        std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                let Some(variables) = variables.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => {
                        debug!(kind = ?event.kind, "policy directory changed");
                        variables.refresh();
                    }
                    Err(e) => error!(error = %e, "policy watcher error"),
                }
            }
            debug!("policy watch thread stopped");
        });

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        info!(dir = %self.dir.display(), "policy store watching");
        Ok(())
    }

    /// Stop watching. Values stay readable; they just stop updating.
    pub fn stop(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if watcher.is_some() {
            info!(dir = %self.dir.display(), "policy store stopped watching");
        }
    }

    /// Whether a directory watch is active.
    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Re-read every field. Failures are logged and returned; each failed
    /// field keeps its previous value.
    pub fn refresh(&self) -> Vec<VariablesError> {
        let errors: Vec<VariablesError> = PolicyField::ALL
            .into_iter()
            .filter_map(|field| self.refresh_field(field).err())
            .collect();
        for e in &errors {
            warn!(error = %e, "policy refresh failed");
        }
        errors
    }

    /// Current values without waiting.
    pub fn snapshot(&self) -> PolicySnapshot {
        let state = self.read_state();
        PolicySnapshot {
            disable_ssh: state.disable_ssh.get(),
            authorized_ssh_keys: state.authorized_ssh_keys.get(),
            host_signer_key: state.host_signer_key.get(),
            registry_auth: state.registry_auth.get(),
            whitelisted_images: state.whitelisted_images.get(),
            disable_custom_commands: state.disable_custom_commands.get(),
        }
    }

    fn refresh_field(&self, field: PolicyField) -> Result<(), VariablesError> {
        match field {
            PolicyField::DisableSsh => self.refresh_disable_ssh(),
            PolicyField::AuthorizedSshKeys => self.refresh_authorized_ssh_keys(),
            PolicyField::HostSignerKey => self.refresh_host_signer_key(),
            PolicyField::RegistryAuth => self.refresh_registry_auth(),
            PolicyField::WhitelistedImages => self.refresh_whitelisted_images(),
            PolicyField::DisableCustomCommands => self.refresh_disable_custom_commands(),
        }
    }

    fn refresh_disable_ssh(&self) -> Result<(), VariablesError> {
        let present = self.marker_present(PolicyField::DisableSsh)?;
        self.write_state().disable_ssh.set(present);
        Ok(())
    }

    fn refresh_authorized_ssh_keys(&self) -> Result<(), VariablesError> {
        let keys = match self.read_content(PolicyField::AuthorizedSshKeys)? {
            Some(content) => {
                parse_authorized_keys(&content).map_err(|source| VariablesError::Parse {
                    field: PolicyField::AuthorizedSshKeys,
                    source,
                })?
            }
            None => Vec::new(),
        };
        self.write_state().authorized_ssh_keys.set(keys);
        Ok(())
    }

    fn refresh_host_signer_key(&self) -> Result<(), VariablesError> {
        let key = self
            .read_content(PolicyField::HostSignerKey)?
            .unwrap_or_default();
        self.write_state().host_signer_key.set(key);
        Ok(())
    }

    fn refresh_registry_auth(&self) -> Result<(), VariablesError> {
        let auth = self
            .read_content(PolicyField::RegistryAuth)?
            .map(|content| content.trim().to_owned())
            .unwrap_or_default();
        self.write_state().registry_auth.set(auth);
        Ok(())
    }

    fn refresh_whitelisted_images(&self) -> Result<(), VariablesError> {
        let images = self
            .read_content(PolicyField::WhitelistedImages)?
            .map(|content| parse_image_list(&content))
            .unwrap_or_default();
        self.write_state().whitelisted_images.set(images);
        Ok(())
    }

    fn refresh_disable_custom_commands(&self) -> Result<(), VariablesError> {
        let present = self.marker_present(PolicyField::DisableCustomCommands)?;
        self.write_state().disable_custom_commands.set(present);
        Ok(())
    }

    fn path_of(&self, field: PolicyField) -> PathBuf {
        self.dir.join(field.file_name())
    }

    fn marker_present(&self, field: PolicyField) -> Result<bool, VariablesError> {
        let path = self.path_of(field);
        match std::fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(VariablesError::Io {
                field,
                path,
                source,
            }),
        }
    }

    fn read_content(&self, field: PolicyField) -> Result<Option<String>, VariablesError> {
        let path = self.path_of(field);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(VariablesError::Io {
                field,
                path,
                source,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poll until `read` yields a value.
    async fn wait_for<T>(&self, read: impl Fn(&PolicyState) -> Option<T>) -> T {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let value = {
                let state = self.read_state();
                read(&state)
            };
            if let Some(value) = value {
                return value;
            }
        }
    }
}

impl Drop for FsVariables {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One image reference per line; surrounding whitespace and blank lines dropped.
fn parse_image_list(content: &str) -> Vec<String> {
    content
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[async_trait]
impl Variables for FsVariables {
    async fn disable_ssh(&self) -> bool {
        self.wait_for(|s| s.disable_ssh.get()).await
    }

    async fn authorized_ssh_keys(&self) -> Vec<AuthorizedKey> {
        self.wait_for(|s| s.authorized_ssh_keys.get()).await
    }

    async fn host_signer_key(&self) -> String {
        self.wait_for(|s| s.host_signer_key.get()).await
    }

    async fn registry_auth(&self) -> String {
        self.wait_for(|s| s.registry_auth.get()).await
    }

    async fn whitelisted_images(&self) -> Vec<String> {
        self.wait_for(|s| s.whitelisted_images.get()).await
    }

    async fn disable_custom_commands(&self) -> bool {
        self.wait_for(|s| s.disable_custom_commands.get()).await
    }
}
