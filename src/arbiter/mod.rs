//! SD bus arbitration between the firmware and the primary device
//!
//! The card has two masters that must never drive it at the same time. The
//! arbiter owns the bus switch and the chip-select sense line and hands out
//! [`BusGuard`]s. Holding a guard means the gate is closed to every other
//! storage operation in the process and the card is routed to the firmware.
//!
//! ```text
//!  Released ──acquire──▶ Acquiring ──sense idle──▶ Held
//!     ▲                                             │ guard dropped
//!     │        debounce expired / instant release   ▼
//!     └────────────────────────────────────── ReleasePending
//!                      acquire before expiry ──▶ Held (no remount)
//! ```
//!
//! Dropping a guard arms the debounce deadline instead of switching the bus
//! back, so bursts of operations pay the switch and mount cost once. A
//! background thread performs the hand-back when the deadline passes.

pub mod hal;


use crate::config::ArbiterConfig;
use hal::BusHardware;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How the bus is handed back when a guard goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Release {
    /// Arm the debounce timer; the next acquire within the window reuses the mount
    #[default]
    Deferred,
    /// Unmount and switch back before the gate opens
    Instant,
}

/// Mount state, only touched with the gate held
#[derive(Debug, Clone, Default)]
pub struct ArbiterState {
    pub held: bool,
    pub pending_release_deadline: Option<Instant>,
    pub pins_initialized: bool,
}

/// Counters readable without waiting for the gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub acquisitions: u64,
    pub mounts: u64,
    pub unmounts: u64,
    pub mount_failures: u64,
    pub held: bool,
    pub release_pending: bool,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    mounts: AtomicU64,
    unmounts: AtomicU64,
    mount_failures: AtomicU64,
    held: AtomicBool,
    release_pending: AtomicBool,
}

struct Bus {
    hardware: Box<dyn BusHardware>,
    state: ArbiterState,
    held_since: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    gate: Mutex<Bus>,
    debounce_signal: Condvar,
    config: ArbiterConfig,
    boot: Instant,
    counters: Counters,
}

/// Owner of the shared SD bus
pub struct Arbiter {
    shared: Arc<Shared>,
    debounce_thread: Option<JoinHandle<()>>,
}

impl Arbiter {
    /// Create an arbiter; uptime for the boot quiescence window starts now
    pub fn new(hardware: Box<dyn BusHardware>, config: ArbiterConfig) -> Self {
        Self::with_boot_instant(hardware, config, Instant::now())
    }

    /// Create an arbiter measuring uptime from `boot`
    pub fn with_boot_instant(
        hardware: Box<dyn BusHardware>,
        config: ArbiterConfig,
        boot: Instant,
    ) -> Self {
        info!(
            "Arbiter starting up (debounce {} ms, poll {} ms, boot quiescence {} ms)",
            config.debounce_ms, config.poll_interval_ms, config.boot_quiescence_ms
        );

        let shared = Arc::new(Shared {
            gate: Mutex::new(Bus {
                hardware,
                state: ArbiterState::default(),
                held_since: None,
                shutdown: false,
            }),
            debounce_signal: Condvar::new(),
            config,
            boot,
            counters: Counters::default(),
        });

        let timer_shared = Arc::clone(&shared);
        let debounce_thread = thread::Builder::new()
            .name("sd-release".to_string())
            .spawn(move || debounce_loop(timer_shared))
            .map_err(|e| error!("Failed to start release timer thread: {}", e))
            .ok();

        Arbiter {
            shared,
            debounce_thread,
        }
    }

    /// Block until this thread owns the bus
    ///
    /// The first acquisition after a hand-back waits out the boot quiescence
    /// window, polls the sense line until the primary device is idle, flips the
    /// switch and mounts. Mount failures are logged; the guard is still granted
    /// and the caller sees the resulting I/O errors.
    pub fn acquire(&self) -> BusGuard<'_> {
        let mut bus = self.shared.gate.lock();

        bus.state.pending_release_deadline = None;
        self.shared
            .counters
            .release_pending
            .store(false, Ordering::SeqCst);
        self.shared
            .counters
            .acquisitions
            .fetch_add(1, Ordering::SeqCst);

        if bus.state.held {
            debug!(thread = ?thread::current().id(), "Soft grabbing SD card");
        } else {
            self.shared.grab(&mut bus);
        }

        BusGuard {
            shared: &self.shared,
            bus,
            release: Release::Deferred,
        }
    }

    /// Hand a held bus back to the primary device without waiting for the debounce
    ///
    /// A no-op when the bus is already released; never waits on the sense line.
    pub fn release_now(&self) {
        let mut bus = self.shared.gate.lock();
        if bus.state.held {
            self.shared.hand_back(&mut bus);
        } else {
            bus.state.pending_release_deadline = None;
            self.shared
                .counters
                .release_pending
                .store(false, Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> ArbiterStats {
        let c = &self.shared.counters;
        ArbiterStats {
            acquisitions: c.acquisitions.load(Ordering::SeqCst),
            mounts: c.mounts.load(Ordering::SeqCst),
            unmounts: c.unmounts.load(Ordering::SeqCst),
            mount_failures: c.mount_failures.load(Ordering::SeqCst),
            held: c.held.load(Ordering::SeqCst),
            release_pending: c.release_pending.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.shared.config
    }

    /// Time since the arbiter's boot reference
    pub fn uptime(&self) -> std::time::Duration {
        self.shared.boot.elapsed()
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        {
            let mut bus = self.shared.gate.lock();
            bus.shutdown = true;
            if bus.state.held {
                self.shared.hand_back(&mut bus);
            }
            self.shared.debounce_signal.notify_all();
        }

        if let Some(handle) = self.debounce_thread.take() {
            if handle.join().is_err() {
                warn!("Release timer thread panicked");
            }
        }
    }
}

impl Shared {
    fn grab(&self, bus: &mut Bus) {
        info!(thread = ?thread::current().id(), "Trying to grab SD card");

        if !bus.state.pins_initialized {
            if let Err(e) = bus.hardware.prepare_switch() {
                error!("Failed to configure bus switch: {}", e);
            }
            bus.state.pins_initialized = true;
        }

        let wait_started = Instant::now();
        let mut announced = false;
        while !self.card_available(bus) {
            if !announced {
                info!("Primary device is using the SD card, waiting for it to be free");
                announced = true;
            }
            thread::sleep(self.config.poll_interval());
        }

        info!(
            "Grabbed SD card after {} ms",
            wait_started.elapsed().as_millis()
        );

        if let Err(e) = bus.hardware.route_to_firmware() {
            error!("Failed to switch SD bus to firmware: {}", e);
        }

        self.counters.mounts.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = bus.hardware.mount() {
            self.counters.mount_failures.fetch_add(1, Ordering::SeqCst);
            error!(
                mounted = bus.hardware.is_mounted(),
                "Failed to mount SD: {}", e
            );
        }

        bus.state.held = true;
        bus.held_since = Some(Instant::now());
        self.counters.held.store(true, Ordering::SeqCst);
    }

    /// Sense line is ignored entirely until the boot window has passed
    fn card_available(&self, bus: &mut Bus) -> bool {
        if self.boot.elapsed() < self.config.boot_quiescence() {
            return false;
        }

        match bus.hardware.sense_idle() {
            Ok(idle) => idle,
            Err(e) => {
                warn!("Failed to read chip-select sense: {}", e);
                false
            }
        }
    }

    fn hand_back(&self, bus: &mut Bus) {
        bus.state.held = false;
        bus.state.pending_release_deadline = None;
        self.counters.held.store(false, Ordering::SeqCst);
        self.counters.release_pending.store(false, Ordering::SeqCst);

        if bus.hardware.is_mounted() {
            self.counters.unmounts.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = bus.hardware.unmount() {
                error!("Failed to unmount SD: {}", e);
            }
        }

        if let Err(e) = bus.hardware.route_to_device() {
            error!("Failed to switch SD bus back to primary device: {}", e);
        }

        let held_ms = bus
            .held_since
            .take()
            .map(|since| since.elapsed().as_millis())
            .unwrap_or(0);
        info!(
            thread = ?thread::current().id(),
            "Released SD card after {} ms", held_ms
        );
    }
}

fn debounce_loop(shared: Arc<Shared>) {
    let mut bus = shared.gate.lock();
    loop {
        if bus.shutdown {
            break;
        }

        let pending = bus.state.pending_release_deadline;
        match pending {
            None => shared.debounce_signal.wait(&mut bus),
            Some(deadline) if Instant::now() >= deadline => shared.hand_back(&mut bus),
            Some(deadline) => {
                shared.debounce_signal.wait_until(&mut bus, deadline);
            }
        }
    }
}

/// Exclusive access to the card; dropping it releases the bus
pub struct BusGuard<'a> {
    shared: &'a Shared,
    bus: MutexGuard<'a, Bus>,
    release: Release,
}

impl BusGuard<'_> {
    /// Native root of the mounted card
    pub fn root(&self) -> &Path {
        self.bus.hardware.root()
    }

    pub fn is_mounted(&self) -> bool {
        self.bus.hardware.is_mounted()
    }

    /// Changes every time the card is mounted again; handles opened under an
    /// older generation are stale
    pub fn mount_generation(&self) -> u64 {
        self.shared.counters.mounts.load(Ordering::SeqCst)
    }

    /// Choose how the bus is released when this guard is dropped
    pub fn set_release(&mut self, release: Release) {
        self.release = release;
    }

    /// Hand the bus back right now
    pub fn release_now(mut self) {
        self.release = Release::Instant;
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        match self.release {
            Release::Deferred => {
                let deadline = Instant::now() + self.shared.config.debounce();
                self.bus.state.pending_release_deadline = Some(deadline);
                self.shared
                    .counters
                    .release_pending
                    .store(true, Ordering::SeqCst);
                self.shared.debounce_signal.notify_one();
            }
            Release::Instant => self.shared.hand_back(&mut self.bus),
        }
    }
}
