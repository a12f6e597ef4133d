//! Hardware seam for the shared SD bus
//!
//! The arbiter only talks to [`BusHardware`]. [`GpioBus`] builds one from any
//! `embedded-hal` pins plus a [`Media`] implementation, so the same arbiter runs
//! against board pins or against the simulated pins used on a host.

use crate::error::{Error, Result};
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Mountable filesystem living on the shared card
pub trait Media: Send {
    fn mount(&mut self) -> io::Result<()>;
    fn unmount(&mut self) -> io::Result<()>;
    fn is_mounted(&self) -> bool;
    /// Native root of the mounted filesystem
    fn root(&self) -> &Path;
}

/// Everything the arbiter needs from the board
pub trait BusHardware: Send {
    /// Configure the switch line; called once, right before the first grab
    fn prepare_switch(&mut self) -> Result<()> {
        Ok(())
    }

    /// True when the primary device is not driving chip-select
    fn sense_idle(&mut self) -> Result<bool>;

    /// Give the bus to the firmware's SPI controller
    fn route_to_firmware(&mut self) -> Result<()>;

    /// Give the bus back to the primary device
    fn route_to_device(&mut self) -> Result<()>;

    fn mount(&mut self) -> Result<()>;
    fn unmount(&mut self) -> Result<()>;
    fn is_mounted(&self) -> bool;
    fn root(&self) -> &Path;
}

/// Bus switch + chip-select sense wired to GPIO pins
///
/// Switch low routes the card to the firmware, high routes it to the primary
/// device. Sense high means the primary device is idle.
pub struct GpioBus<S, W, M> {
    sense: S,
    switch: W,
    media: M,
}

impl<S, W, M> GpioBus<S, W, M>
where
    S: InputPin + Send,
    W: OutputPin + Send,
    M: Media,
{
    pub fn new(sense: S, switch: W, media: M) -> Self {
        GpioBus {
            sense,
            switch,
            media,
        }
    }

    pub fn media(&self) -> &M {
        &self.media
    }
}

fn pin_error<E: core::fmt::Debug>(what: &str, err: E) -> Error {
    Error::Media(format!("{} pin error: {:?}", what, err))
}

impl<S, W, M> BusHardware for GpioBus<S, W, M>
where
    S: InputPin + Send,
    W: OutputPin + Send,
    M: Media,
{
    fn prepare_switch(&mut self) -> Result<()> {
        // Start from the device-owned level so the first edge is the grab itself
        self.switch
            .set_high()
            .map_err(|e| pin_error("switch", e))
    }

    fn sense_idle(&mut self) -> Result<bool> {
        self.sense.is_high().map_err(|e| pin_error("sense", e))
    }

    fn route_to_firmware(&mut self) -> Result<()> {
        self.switch.set_low().map_err(|e| pin_error("switch", e))
    }

    fn route_to_device(&mut self) -> Result<()> {
        self.switch.set_high().map_err(|e| pin_error("switch", e))
    }

    fn mount(&mut self) -> Result<()> {
        self.media
            .mount()
            .map_err(|e| Error::Media(format!("mount failed: {}", e)))
    }

    fn unmount(&mut self) -> Result<()> {
        self.media
            .unmount()
            .map_err(|e| Error::Media(format!("unmount failed: {}", e)))
    }

    fn is_mounted(&self) -> bool {
        self.media.is_mounted()
    }

    fn root(&self) -> &Path {
        self.media.root()
    }
}

/// Card contents exposed as a host directory
///
/// Mounting only checks that the directory is there; file access itself goes
/// through `std::fs` under [`Media::root`].
#[derive(Debug)]
pub struct DirectoryMedia {
    root: PathBuf,
    mounted: bool,
}

impl DirectoryMedia {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DirectoryMedia {
            root: root.as_ref().to_path_buf(),
            mounted: false,
        }
    }
}

impl Media for DirectoryMedia {
    fn mount(&mut self) -> io::Result<()> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no card at {:?}", self.root),
            ));
        }
        debug!("Mounted {:?}", self.root);
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> io::Result<()> {
        debug!("Unmounted {:?}", self.root);
        self.mounted = false;
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Chip-select sense line driven from software
///
/// Clones share the same level, so a test or a host console can play the
/// primary device.
#[derive(Debug, Clone)]
pub struct SimulatedSense {
    high: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl SimulatedSense {
    /// New line, idle (high) or busy (low)
    pub fn new(idle: bool) -> Self {
        SimulatedSense {
            high: Arc::new(AtomicBool::new(idle)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Primary device stops (true) or starts (false) using the card
    pub fn set_idle(&self, idle: bool) {
        self.high.store(idle, Ordering::SeqCst);
    }

    /// Number of times the line was sampled
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ErrorType for SimulatedSense {
    type Error = Infallible;
}

impl InputPin for SimulatedSense {
    fn is_high(&mut self) -> std::result::Result<bool, Self::Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.high.load(Ordering::SeqCst))
    }

    fn is_low(&mut self) -> std::result::Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

/// Bus switch output that records its level and edge count
#[derive(Debug, Clone)]
pub struct SimulatedSwitch {
    high: Arc<AtomicBool>,
    edges: Arc<AtomicUsize>,
}

impl SimulatedSwitch {
    pub fn new() -> Self {
        SimulatedSwitch {
            high: Arc::new(AtomicBool::new(true)),
            edges: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// True while the firmware owns the bus
    pub fn routed_to_firmware(&self) -> bool {
        !self.high.load(Ordering::SeqCst)
    }

    /// Level changes seen so far
    pub fn edges(&self) -> usize {
        self.edges.load(Ordering::SeqCst)
    }

    fn drive(&self, high: bool) {
        if self.high.swap(high, Ordering::SeqCst) != high {
            self.edges.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Default for SimulatedSwitch {
    fn default() -> Self {
        SimulatedSwitch::new()
    }
}

impl ErrorType for SimulatedSwitch {
    type Error = Infallible;
}

impl OutputPin for SimulatedSwitch {
    fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}
