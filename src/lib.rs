//! # sdshare - Shared SD Card Access over WebDAV
//!
//! `sdshare` lets a network-attached controller share an SD card with a
//! primary device that also uses it. The controller only touches the card
//! while the primary device's bus is idle, and serves the contents over
//! WebDAV plus a small status site.
//!
//! - **Bus arbitration**: one owner at a time, debounced hand-back
//! - **Storage access layer**: every file operation acquires the bus first
//! - **Record codec**: fixed-size records with a CRC16 header checksum
//! - **Dispatch engine**: worker pool with panic isolation and listener restart
//! - **WebDAV**: the RFC 4918 subset desktop clients need
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sdshare::arbiter::hal::{DirectoryMedia, GpioBus, SimulatedSense, SimulatedSwitch};
//! use sdshare::{Arbiter, ArbiterConfig, Result, Storage};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let hardware = GpioBus::new(
//!     SimulatedSense::new(true),
//!     SimulatedSwitch::new(),
//!     DirectoryMedia::new("/mnt/card"),
//! );
//! let arbiter = Arc::new(Arbiter::new(Box::new(hardware), ArbiterConfig::default()));
//! let storage = Storage::new(arbiter);
//!
//! storage.write_raw("/notes.txt", b"hello")?;
//! let text = storage.read_text("/notes.txt")?;
//! assert_eq!(text, "hello");
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod config;
pub mod dav;
pub mod error;
pub mod http;
pub mod link;
pub mod logging;
pub mod maintenance;
pub mod record;
pub mod status;
pub mod storage;

pub use arbiter::{Arbiter, ArbiterStats, BusGuard, Release};
pub use config::{ArbiterConfig, DispatchConfig, Settings, SettingsFile};
pub use dav::DavHandler;
pub use error::{Error, Result};
pub use http::{Handler, HttpServer, ServerHandle};
pub use link::{CredentialWatcher, Credentials, HostControl, SystemControl};
pub use logging::LogRing;
pub use maintenance::{bulk_patch, BulkPatchReport, PatchRequest};
pub use record::{crc16, Record, RECORD_LEN};
pub use status::StatusHandler;
pub use storage::{FileProperties, Storage};
