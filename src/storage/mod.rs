//! Storage access layer
//!
//! Every public operation translates the client path, takes the bus through
//! the [`Arbiter`], performs its I/O and lets the guard go again. Acquiring
//! the bus also flushes the deferred write queue, so any reader sees queued
//! content before its own operation runs.
//!
//! ```text
//!  client path ──paths::to_native──▶ native path
//!                                       │
//!  Arbiter::acquire ──▶ flush queue ──▶ I/O ──▶ guard dropped (debounced)
//! ```

pub mod handle;
pub mod paths;


use crate::arbiter::{Arbiter, BusGuard, Release};
use crate::error::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use handle::HandleCache;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Streaming buffer for request bodies
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Credential file whose overwrite is announced to subscribers
pub const CREDENTIALS_FILE: &str = "wifi.ini";

/// Size and modification time of a file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProperties {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Overwrite waiting for the next bus acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueEntry {
    pub relative_path: String,
    pub content: String,
}

/// Result of [`Storage::stream_to_client`]
pub enum ClientStream<'a> {
    /// `If-Modified-Since` matched; the client copy is current
    NotModified(FileProperties),
    /// File contents; the bus stays held until the reader is dropped
    Content {
        properties: FileProperties,
        reader: FileReader<'a>,
    },
}

/// File contents read through the cached handle while the bus is held
///
/// Yields at most the length recorded when the stream was opened.
pub struct FileReader<'a> {
    storage: &'a Storage,
    _guard: BusGuard<'a>,
    native: PathBuf,
    position: u64,
    len: u64,
}

impl FileReader<'_> {
    /// Bytes left to read
    pub fn remaining(&self) -> u64 {
        self.len - self.position
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = self.remaining().min(buf.len() as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        let read = self
            .storage
            .handles
            .lock()
            .read_at(&self.native, self.position, &mut buf[..want])
            .map_err(|e| {
                error!(op = "stream to client", path = ?self.native, "Read failed mid-stream: {}", e);
                e
            })?;
        self.position += read as u64;
        Ok(read)
    }
}

/// File and directory access on the shared card
pub struct Storage {
    arbiter: Arc<Arbiter>,
    write_queue: Mutex<Vec<WriteQueueEntry>>,
    handles: Mutex<HandleCache>,
    credentials_tx: Sender<()>,
    credentials_rx: Receiver<()>,
}

impl Storage {
    pub fn new(arbiter: Arc<Arbiter>) -> Self {
        let (credentials_tx, credentials_rx) = channel::bounded(1);
        Storage {
            arbiter,
            write_queue: Mutex::new(Vec::new()),
            handles: Mutex::new(HandleCache::new()),
            credentials_tx,
            credentials_rx,
        }
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    /// Channel signalled each time the credential file is written by a client
    ///
    /// Signals coalesce: a consumer that is behind sees one pending event.
    pub fn subscribe_credentials(&self) -> Receiver<()> {
        self.credentials_rx.clone()
    }

    /// Take the bus and apply queued writes
    fn acquire(&self, release: Release) -> BusGuard<'_> {
        let mut guard = self.arbiter.acquire();
        guard.set_release(release);
        self.handles.lock().bind_generation(guard.mount_generation());
        self.flush_queue(&guard);
        guard
    }

    fn flush_queue(&self, guard: &BusGuard<'_>) {
        let pending = std::mem::take(&mut *self.write_queue.lock());
        if pending.is_empty() {
            return;
        }

        let mut handles = self.handles.lock();
        // Queue order, so a later write to the same path wins
        for entry in pending {
            let result = paths::to_native(guard.root(), &entry.relative_path).and_then(|native| {
                handles.invalidate_path(&native);
                fs::write(&native, entry.content.as_bytes())
                    .map_err(|e| Error::from_io("flush queued write", &entry.relative_path, e))
            });

            match result {
                Ok(()) => debug!(path = %entry.relative_path, "Flushed queued write"),
                Err(e) => error!(
                    op = "flush queued write",
                    path = %entry.relative_path,
                    "Queued write failed: {}", e
                ),
            }
        }
    }

    /// Overwrite `path` with `content` on the next acquisition; never blocks on the bus
    pub fn queue_write(&self, path: &str, content: impl Into<String>) {
        let mut queue = self.write_queue.lock();
        queue.push(WriteQueueEntry {
            relative_path: path.to_string(),
            content: content.into(),
        });
        debug!(path, queued = queue.len(), "Queued write");
    }

    /// Writes not yet flushed
    pub fn queued_writes(&self) -> usize {
        self.write_queue.lock().len()
    }

    pub fn read_text(&self, path: &str) -> Result<String> {
        self.read_text_with(path, Release::Deferred)
    }

    /// Read a text file, choosing how the bus is released afterwards
    pub fn read_text_with(&self, path: &str, release: Release) -> Result<String> {
        let op = "read text";
        let guard = self.acquire(release);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            fs::read_to_string(&native).map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    /// Whole file through the cached handle
    pub fn read_raw(&self, path: &str) -> Result<Vec<u8>> {
        let op = "read raw";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            let mut handles = self.handles.lock();
            let io_result: io::Result<Vec<u8>> = (|| {
                let len = handles.length(&native)?;
                let mut data = vec![0u8; len as usize];
                let read = handles.read_at(&native, 0, &mut data)?;
                data.truncate(read);
                Ok(data)
            })();
            io_result.map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    /// Create or truncate `path` and write `data`
    pub fn write_raw(&self, path: &str, data: &[u8]) -> Result<()> {
        let op = "write raw";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            let mut handles = self.handles.lock();
            handles
                .create(&native)
                .and_then(|_| handles.write_at(&native, 0, data))
                .map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    /// Compare `expected.len()` bytes at `offset` without reading the rest of the file
    pub fn check_region(&self, path: &str, offset: u64, expected: &[u8]) -> Result<bool> {
        let op = "check region";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            let mut buf = vec![0u8; expected.len()];
            self.handles
                .lock()
                .read_at(&native, offset, &mut buf)
                .map(|read| read == expected.len() && buf == expected)
                .map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let op = "delete file";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            self.handles.lock().invalidate_path(&native);
            if !native.is_file() {
                return Err(Error::NotFound(path.to_string()));
            }
            fs::remove_file(&native).map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    pub fn delete_directory(&self, path: &str, recursive: bool) -> Result<()> {
        let op = "delete directory";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            if native == guard.root() {
                return Err(Error::InvalidArgument("cannot delete the card root".to_string()));
            }
            self.handles.lock().invalidate_path(&native);
            if !native.is_dir() {
                return Err(Error::NotFound(path.to_string()));
            }
            let removed = if recursive {
                fs::remove_dir_all(&native)
            } else {
                fs::remove_dir(&native)
            };
            removed.map_err(|e| Error::from_io(op, path, e))
        });
        logged(op, path, result)
    }

    pub fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.move_entry("move file", from, to, false)
    }

    pub fn move_directory(&self, from: &str, to: &str) -> Result<()> {
        self.move_entry("move directory", from, to, true)
    }

    fn move_entry(&self, op: &'static str, from: &str, to: &str, directory: bool) -> Result<()> {
        let guard = self.acquire(Release::Deferred);
        let result: Result<()> = (|| {
            let source = paths::to_native(guard.root(), from)?;
            let target = paths::to_native(guard.root(), to)?;

            let exists = if directory {
                source.is_dir()
            } else {
                source.is_file()
            };
            if !exists {
                return Err(Error::NotFound(from.to_string()));
            }
            if target.exists() {
                return Err(Error::Conflict(to.to_string()));
            }

            let mut handles = self.handles.lock();
            handles.invalidate_path(&source);
            handles.invalidate_path(&target);
            fs::rename(&source, &target).map_err(|e| Error::from_io(op, from, e))
        })();

        if result.is_ok() {
            info!(op, from, to, "Moved");
        }
        logged(op, from, result)
    }

    /// Create a directory and any missing parents
    pub fn create_directory(&self, path: &str) -> Result<()> {
        let op = "create directory";
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path)
            .and_then(|native| fs::create_dir_all(&native).map_err(|e| Error::from_io(op, path, e)));
        logged(op, path, result)
    }

    pub fn exists_file(&self, path: &str) -> bool {
        self.probe("exists file", path, |native| {
            fs::metadata(native).map(|m| m.is_file())
        })
    }

    pub fn exists_directory(&self, path: &str) -> bool {
        self.probe("exists directory", path, |native| {
            fs::metadata(native).map(|m| m.is_dir())
        })
    }

    /// Existence checks swallow every error as "absent"
    fn probe<F>(&self, op: &'static str, path: &str, check: F) -> bool
    where
        F: FnOnce(&PathBuf) -> io::Result<bool>,
    {
        let guard = self.acquire(Release::Deferred);
        let native = match paths::to_native(guard.root(), path) {
            Ok(native) => native,
            Err(e) => {
                warn!(op, path, "Treating invalid path as absent: {}", e);
                return false;
            }
        };

        match check(&native) {
            Ok(found) => found,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(op, path, "Treating unreadable path as absent: {}", e);
                false
            }
        }
    }

    pub fn list_directories(&self, path: &str) -> Result<Vec<String>> {
        self.list("list directories", path, true)
    }

    pub fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.list("list files", path, false)
    }

    fn list(&self, op: &'static str, path: &str, directories: bool) -> Result<Vec<String>> {
        let guard = self.acquire(Release::Deferred);
        let result: Result<Vec<String>> = (|| {
            let native = paths::to_native(guard.root(), path)?;
            let mut found = Vec::new();
            for entry in fs::read_dir(&native).map_err(|e| Error::from_io(op, path, e))? {
                let entry = entry.map_err(|e| Error::from_io(op, path, e))?;
                let is_dir = entry
                    .file_type()
                    .map_err(|e| Error::from_io(op, path, e))?
                    .is_dir();
                if is_dir == directories {
                    found.push(paths::to_client(guard.root(), &entry.path())?);
                }
            }
            found.sort();
            Ok(found)
        })();
        logged(op, path, result)
    }

    /// Every file below `path` whose name ends with `extension` (case-insensitive)
    ///
    /// Walks with an explicit stack, so deep trees do not grow the call stack.
    pub fn list_files_recursive(&self, path: &str, extension: Option<&str>) -> Result<Vec<String>> {
        let op = "list files recursive";
        let extension = extension.map(|e| e.to_ascii_lowercase());
        let guard = self.acquire(Release::Deferred);
        let result: Result<Vec<String>> = (|| {
            let start = paths::to_native(guard.root(), path)?;
            let mut pending = vec![start.clone()];
            let mut found = Vec::new();

            while let Some(dir) = pending.pop() {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if dir == start => return Err(Error::from_io(op, path, e)),
                    Err(e) => {
                        warn!(op, dir = ?dir, "Skipping unreadable directory: {}", e);
                        continue;
                    }
                };

                for entry in entries.flatten() {
                    let entry_path = entry.path();
                    match entry.file_type() {
                        Ok(t) if t.is_dir() => pending.push(entry_path),
                        Ok(t) if t.is_file() => {
                            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
                            let wanted = extension
                                .as_deref()
                                .map(|ext| name.ends_with(ext))
                                .unwrap_or(true);
                            if wanted {
                                found.push(paths::to_client(guard.root(), &entry_path)?);
                            }
                        }
                        _ => {}
                    }
                }
            }

            found.sort();
            Ok(found)
        })();
        logged(op, path, result)
    }

    pub fn file_properties(&self, path: &str) -> Result<FileProperties> {
        self.properties("file properties", path, false)
    }

    pub fn directory_properties(&self, path: &str) -> Result<FileProperties> {
        self.properties("directory properties", path, true)
    }

    fn properties(&self, op: &'static str, path: &str, directory: bool) -> Result<FileProperties> {
        let guard = self.acquire(Release::Deferred);
        let result = paths::to_native(guard.root(), path).and_then(|native| {
            let meta = fs::metadata(&native).map_err(|e| Error::from_io(op, path, e))?;
            if meta.is_dir() != directory {
                return Err(Error::NotFound(path.to_string()));
            }
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(FileProperties {
                size: if directory { 0 } else { meta.len() },
                modified,
            })
        });
        logged(op, path, result)
    }

    /// Parent directory of a client path; `None` for the root
    pub fn parent_of(&self, path: &str) -> Result<Option<String>> {
        paths::parent(path)
    }

    /// Open a file for sending to a client
    ///
    /// When `if_modified_since` is at or after the file's modification time
    /// (compared at HTTP date precision) only the properties come back. With
    /// `send_body` false the reader is empty but the properties still carry
    /// the full size. The bus is held for as long as the reader lives.
    pub fn stream_to_client(
        &self,
        path: &str,
        if_modified_since: Option<DateTime<Utc>>,
        send_body: bool,
    ) -> Result<ClientStream<'_>> {
        let op = "stream to client";
        let guard = self.acquire(Release::Deferred);
        let opened: Result<(PathBuf, FileProperties)> = (|| {
            let native = paths::to_native(guard.root(), path)?;
            let meta = fs::metadata(&native).map_err(|e| Error::from_io(op, path, e))?;
            if !meta.is_file() {
                return Err(Error::NotFound(path.to_string()));
            }
            let properties = FileProperties {
                size: meta.len(),
                modified: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            };
            Ok((native, properties))
        })();
        let (native, properties) = logged(op, path, opened)?;

        if let Some(since) = if_modified_since {
            if properties.modified.trunc_subsecs(0) <= since {
                debug!(path, "Client copy is current");
                return Ok(ClientStream::NotModified(properties));
            }
        }

        Ok(ClientStream::Content {
            properties,
            reader: FileReader {
                storage: self,
                _guard: guard,
                native,
                position: 0,
                len: if send_body { properties.size } else { 0 },
            },
        })
    }

    /// Write exactly `expected_len` bytes from `reader` into `path`
    ///
    /// The reader is never asked for more than `expected_len` bytes; an early
    /// end of stream is an error. Returns the number of bytes written.
    pub fn stream_from_client(
        &self,
        path: &str,
        reader: &mut dyn Read,
        expected_len: u64,
    ) -> Result<u64> {
        let op = "stream from client";
        let guard = self.acquire(Release::Deferred);
        let result: Result<u64> = (|| {
            let native = paths::to_native(guard.root(), path)?;
            let mut handles = self.handles.lock();
            handles
                .create(&native)
                .map_err(|e| Error::from_io(op, path, e))?;

            let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
            let mut written = 0u64;
            while written < expected_len {
                let want = (expected_len - written).min(buf.len() as u64) as usize;
                let read = match reader.read(&mut buf[..want]) {
                    Ok(0) => {
                        return Err(Error::from_io(
                            op,
                            path,
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                format!("body ended after {} of {} bytes", written, expected_len),
                            ),
                        ))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::from_io(op, path, e)),
                };
                handles
                    .write_at(&native, written, &buf[..read])
                    .map_err(|e| Error::from_io(op, path, e))?;
                written += read as u64;
            }
            handles.sync().map_err(|e| Error::from_io(op, path, e))?;
            Ok(written)
        })();
        drop(guard);

        let written = logged(op, path, result)?;
        if paths::is_root_file(path, CREDENTIALS_FILE) {
            self.publish_credentials_update();
        }
        Ok(written)
    }

    fn publish_credentials_update(&self) {
        match self.credentials_tx.try_send(()) {
            Ok(()) => info!("Credential file updated, notifying subscriber"),
            Err(TrySendError::Full(())) => debug!("Credential update already pending"),
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

/// Log a failed operation with its context and hand the result back
fn logged<T>(op: &'static str, path: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        match e {
            Error::NotFound(_) => debug!(op, path, "{}", e),
            _ => error!(op, path, thread = ?std::thread::current().id(), "{}", e),
        }
    }
    result
}
