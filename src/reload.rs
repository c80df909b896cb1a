//! Atomic configuration snapshots and the live-reload pipeline.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::events::{Event, EventBus};

/// Holds the current configuration behind a single mutex. Readers take a
/// short critical section to clone the Arc, then read without the lock.
/// Writers are serialised by the same mutex; subscribers observe the
/// config-update event strictly after the pointer has been swapped.
pub struct ConfigService {
    current: Mutex<Arc<Config>>,
    origin: Option<PathBuf>,
    events: Arc<EventBus>,
}

impl ConfigService {
    pub fn new(initial: Config, origin: Option<PathBuf>, events: Arc<EventBus>) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
            origin,
            events,
        }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<Config> {
        self.current.lock().unwrap().clone()
    }

    /// Validates and applies a new configuration. Validation errors abort the
    /// apply with no state change and no events. Persistence failure degrades
    /// to a warning; the in-memory apply still takes effect.
    pub fn apply(&self, new: Config, persist: bool) -> Result<Vec<String>, ProxyError> {
        let (mut warnings, errors) = new.validate();
        if !errors.is_empty() {
            return Err(ProxyError::ConfigInvalid(errors.join("; ")));
        }

        let new = Arc::new(new);
        let previous = {
            let mut current = self.current.lock().unwrap();
            std::mem::replace(&mut *current, Arc::clone(&new))
        };
        self.events.publish(Event::ConfigUpdate {
            new: Arc::clone(&new),
            previous,
        });
        info!("applied configuration");

        if persist {
            match self.persist(&new) {
                Ok(()) => info!("config persisted to disk"),
                Err(err) => {
                    warn!(error = %err, "failed to persist config (in-memory apply succeeded)");
                    warnings.push(format!("failed to persist config to disk: {err}"));
                }
            }
        }
        Ok(warnings)
    }

    /// Parses YAML and applies it. Malformed YAML is a validation failure.
    pub fn apply_yaml(&self, text: &str, persist: bool) -> Result<Vec<String>, ProxyError> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|err| ProxyError::ConfigInvalid(format!("invalid YAML: {err}")))?;
        self.apply(config, persist)
    }

    fn persist(&self, config: &Config) -> Result<(), ProxyError> {
        let Some(path) = &self.origin else {
            return Err(ProxyError::ConfigPersistFailed(
                "config file path not available".into(),
            ));
        };
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => {}
            _ => {
                return Err(ProxyError::ConfigPersistFailed(format!(
                    "unsupported config file format: {} (only .yml and .yaml are supported)",
                    path.display()
                )))
            }
        }
        let data = serde_yaml::to_string(config)
            .map_err(|err| ProxyError::ConfigPersistFailed(err.to_string()))?;
        std::fs::write(path, data)
            .map_err(|err| ProxyError::ConfigPersistFailed(err.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
                .map_err(|err| ProxyError::ConfigPersistFailed(err.to_string()))?;
        }
        Ok(())
    }
}
