//! Persisted settings and runtime tunables
//!
//! Settings live in a small JSON file on internal storage, never on the shared
//! card. A missing or malformed file is replaced with defaults.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default settings file name inside the internal directory
pub const SETTINGS_FILE_NAME: &str = "sdshare_config.json";

/// Bus arbitration timing
///
/// Hardware dependent; the defaults match a device that needs roughly ten
/// seconds after power-up before its chip-select line means anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ArbiterConfig {
    /// Idle time after the last release before the bus is handed back
    pub debounce_ms: u64,
    /// Sense pin poll interval while the primary device holds the card
    pub poll_interval_ms: u64,
    /// Uptime before which the sense pin is not read at all
    pub boot_quiescence_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            debounce_ms: 1_000,
            poll_interval_ms: 100,
            boot_quiescence_ms: 10_000,
        }
    }
}

impl ArbiterConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn boot_quiescence(&self) -> Duration {
        Duration::from_millis(self.boot_quiescence_ms)
    }
}

/// HTTP dispatch engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DispatchConfig {
    /// Worker threads per server
    pub workers: usize,
    /// Received requests waiting for a worker
    pub queue_depth: usize,
    /// Pause before a failed listener is rebuilt
    pub restart_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            workers: 4,
            queue_depth: 16,
            restart_backoff_ms: 1_000,
        }
    }
}

impl DispatchConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Contents of the settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// Seconds after boot during which the card is left alone
    pub boot_lock_delay: u32,
    /// Apply the boot lock only to the credential check, not to all card access
    pub boot_lock_wifi_only: bool,
    pub arbiter: ArbiterConfig,
    pub dispatch: DispatchConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            boot_lock_delay: 30,
            boot_lock_wifi_only: false,
            arbiter: ArbiterConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Settings {
    /// Parse settings from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize settings to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn boot_lock_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.boot_lock_delay))
    }

    /// Arbiter timing with the boot lock folded into the quiescence window
    pub fn effective_arbiter(&self) -> ArbiterConfig {
        let mut arbiter = self.arbiter;
        if !self.boot_lock_wifi_only {
            let lock_ms = u64::from(self.boot_lock_delay) * 1_000;
            arbiter.boot_quiescence_ms = arbiter.boot_quiescence_ms.max(lock_ms);
        }
        arbiter
    }
}

/// Settings bound to their file; every update is written through
#[derive(Debug)]
pub struct SettingsFile {
    path: PathBuf,
    current: Mutex<Settings>,
}

impl SettingsFile {
    /// Load settings, recreating the file with defaults when missing or malformed
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let loaded = match std::fs::read_to_string(&path) {
            Ok(text) => match Settings::from_json(&text) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    warn!("Settings file {:?} is malformed ({}), using defaults", path, e);
                    None
                }
            },
            Err(e) => {
                info!("No settings file at {:?} ({}), using defaults", path, e);
                None
            }
        };

        let file = SettingsFile {
            path,
            current: Mutex::new(loaded.clone().unwrap_or_default()),
        };

        if loaded.is_none() {
            if let Err(e) = file.persist(&file.current.lock()) {
                warn!("Failed to write default settings to {:?}: {}", file.path, e);
            }
        }

        file
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.current.lock().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a change and write the file
    pub fn update<F: FnOnce(&mut Settings)>(&self, change: F) -> Result<Settings> {
        let mut current = self.current.lock();
        change(&mut current);
        info!(
            "Updating settings: boot_lock_delay={} boot_lock_wifi_only={}",
            current.boot_lock_delay, current.boot_lock_wifi_only
        );
        self.persist(&current)?;
        Ok(current.clone())
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        let json = settings.to_json()?;
        std::fs::write(&self.path, json)
            .map_err(|e| Error::from_io("write settings", &self.path.to_string_lossy(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.boot_lock_delay, 30);
        assert!(!settings.boot_lock_wifi_only);
        assert_eq!(settings.arbiter.debounce_ms, 1_000);
        assert_eq!(settings.arbiter.poll_interval_ms, 100);
        assert_eq!(settings.dispatch.workers, 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings = Settings::from_json(r#"{"BootLockDelay": 5}"#).unwrap();
        assert_eq!(settings.boot_lock_delay, 5);
        assert!(!settings.boot_lock_wifi_only);
        assert_eq!(settings.arbiter, ArbiterConfig::default());
    }

    #[test]
    fn test_effective_quiescence() {
        let mut settings = Settings::default();
        assert_eq!(settings.effective_arbiter().boot_quiescence_ms, 30_000);

        settings.boot_lock_wifi_only = true;
        assert_eq!(settings.effective_arbiter().boot_quiescence_ms, 10_000);

        settings.boot_lock_wifi_only = false;
        settings.boot_lock_delay = 2;
        assert_eq!(settings.effective_arbiter().boot_quiescence_ms, 10_000);
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let file = SettingsFile::load_or_create(&path);
        assert_eq!(file.get(), Settings::default());
        assert!(path.exists());

        let reread = Settings::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread, Settings::default());
    }

    #[test]
    fn test_malformed_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let file = SettingsFile::load_or_create(&path);
        assert_eq!(file.get(), Settings::default());
        assert!(Settings::from_json(&std::fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let file = SettingsFile::load_or_create(&path);
        file.update(|s| {
            s.boot_lock_delay = 12;
            s.boot_lock_wifi_only = true;
        })
        .unwrap();

        let reopened = SettingsFile::load_or_create(&path);
        assert_eq!(reopened.get().boot_lock_delay, 12);
        assert!(reopened.get().boot_lock_wifi_only);
    }
}
