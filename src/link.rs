//! Network credential hand-off
//!
//! Users drop a `wifi.ini` on the card. The watcher copies valid credentials
//! into the internal directory and asks the system to restart so the network
//! stack picks them up. A marker file lets the next boot skip the re-check.

use crate::arbiter::Release;
use crate::error::{Error, Result};
use crate::storage::{Storage, CREDENTIALS_FILE};
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Marker written before a credential-triggered restart
pub const REBOOT_MARKER: &str = "wifiReboot";

/// Marker that keeps the network down on the next boot
pub const DISABLE_MARKER: &str = "disableWifi";

/// Delay between accepting new credentials and restarting
pub const REBOOT_DELAY: Duration = Duration::from_secs(5);

/// `key = value` lines; anything without `=` is ignored
///
/// Splits on the first `=`, trims both sides. Later keys win.
pub fn parse_ini(text: &str) -> HashMap<String, String> {
    text.split(['\r', '\n'])
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    /// None unless both `ssid` and `password` are present and non-empty
    pub fn from_ini(text: &str) -> Option<Self> {
        let values = parse_ini(text);
        let ssid = values.get("ssid").filter(|s| !s.is_empty())?;
        let password = values.get("password").filter(|s| !s.is_empty())?;
        Some(Credentials {
            ssid: ssid.clone(),
            password: password.clone(),
        })
    }
}

/// Platform actions the firmware cannot perform itself
pub trait SystemControl: Send + Sync {
    fn schedule_reboot(&self, delay: Duration);
}

/// Host stand-in: logs and counts reboot requests
#[derive(Debug, Default)]
pub struct HostControl {
    reboots: AtomicUsize,
}

impl HostControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboot_requests(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl SystemControl for HostControl {
    fn schedule_reboot(&self, delay: Duration) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        warn!("Reboot requested in {} ms; host build keeps running", delay.as_millis());
    }
}

/// Result of comparing the card's credentials with the cached copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Missing,
    Unchanged,
    Invalid,
    Updated,
}

/// Why this boot happened, as far as the watcher can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    Normal,
    AfterCredentialUpdate,
}

pub struct CredentialWatcher {
    storage: Arc<Storage>,
    internal_dir: PathBuf,
    control: Arc<dyn SystemControl>,
    cached: Mutex<Option<String>>,
}

impl CredentialWatcher {
    pub fn new(storage: Arc<Storage>, internal_dir: &Path, control: Arc<dyn SystemControl>) -> Self {
        let cached = fs::read_to_string(internal_dir.join(CREDENTIALS_FILE)).ok();
        CredentialWatcher {
            storage,
            internal_dir: internal_dir.to_path_buf(),
            control,
            cached: Mutex::new(cached),
        }
    }

    /// Consume the restart marker, if any
    pub fn boot(&self) -> BootKind {
        let marker = self.internal_dir.join(REBOOT_MARKER);
        if !marker.exists() {
            return BootKind::Normal;
        }
        if let Err(e) = fs::remove_file(&marker) {
            error!("Failed to remove {}: {}", marker.display(), e);
        }
        info!("Restarted for new credentials; skipping the post-boot check");
        BootKind::AfterCredentialUpdate
    }

    pub fn cached_credentials(&self) -> Option<Credentials> {
        self.cached.lock().as_deref().and_then(Credentials::from_ini)
    }

    pub fn network_disabled(&self) -> bool {
        self.internal_dir.join(DISABLE_MARKER).exists()
    }

    /// Re-read the card's credential file and act on a change
    pub fn check_now(&self) -> Result<CheckOutcome> {
        let path = format!("/{}", CREDENTIALS_FILE);
        let text = match self.storage.read_text_with(&path, Release::Instant) {
            Ok(text) => text,
            Err(Error::NotFound(_)) => {
                debug!("No credential file on the card");
                return Ok(CheckOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let mut cached = self.cached.lock();
        if cached.as_deref() == Some(text.as_str()) {
            debug!("Credentials unchanged");
            return Ok(CheckOutcome::Unchanged);
        }

        let Some(credentials) = Credentials::from_ini(&text) else {
            warn!("Credential file is missing ssid or password; ignoring");
            return Ok(CheckOutcome::Invalid);
        };

        let cache_path = self.internal_dir.join(CREDENTIALS_FILE);
        fs::write(&cache_path, &text)
            .map_err(|e| Error::from_io("write credential cache", &cache_path.to_string_lossy(), e))?;
        let marker = self.internal_dir.join(REBOOT_MARKER);
        fs::write(&marker, b"")
            .map_err(|e| Error::from_io("write reboot marker", &marker.to_string_lossy(), e))?;
        *cached = Some(text);

        info!(ssid = %credentials.ssid, "New credentials stored; rebooting");
        self.control.schedule_reboot(REBOOT_DELAY);
        Ok(CheckOutcome::Updated)
    }

    fn check_logged(&self) {
        if let Err(e) = self.check_now() {
            error!("Credential check failed: {}", e);
        }
    }

    /// Run the watcher thread
    ///
    /// Checks once after `initial_delay` (when given) and again after every
    /// write to the credential file.
    pub fn spawn(self: Arc<Self>, initial_delay: Option<Duration>) -> Result<WatcherHandle> {
        let updates = self.storage.subscribe_credentials();
        let (stop_tx, stop_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name("credential-watch".to_string())
            .spawn(move || self.run(updates, stop_rx, initial_delay))
            .map_err(|e| Error::from_io("spawn credential watcher", "", e))?;

        Ok(WatcherHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn run(&self, updates: Receiver<()>, stop: Receiver<()>, initial_delay: Option<Duration>) {
        let mut deadline = initial_delay.map(|d| Instant::now() + d);

        loop {
            let timeout = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));

            select! {
                recv(stop) -> _ => break,
                recv(updates) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    info!("Credential file written");
                    self.check_logged();
                }
                default(timeout) => {
                    if deadline.take().is_some() {
                        info!("Post-boot credential check");
                        self.check_logged();
                    }
                }
            }
        }
        debug!("Credential watcher stopped");
    }
}

/// Stops the watcher thread on drop
pub struct WatcherHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
