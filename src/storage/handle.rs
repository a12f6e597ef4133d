//! Long-lived file handle for offset-addressed card I/O
//!
//! Opening a file on the card is the expensive part of a small read, so the
//! storage layer keeps one handle around and repositions it instead of opening
//! and closing per call. The handle is tied to a mount generation and dropped
//! as soon as the card has been remounted.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

struct OpenHandle {
    path: PathBuf,
    file: File,
    writable: bool,
}

/// Single cached handle, reopened whenever the target path or mount changes
#[derive(Default)]
pub struct HandleCache {
    open: Option<OpenHandle>,
    generation: u64,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the handle if it was opened under another mount
    pub fn bind_generation(&mut self, generation: u64) {
        if self.generation != generation {
            self.invalidate();
            self.generation = generation;
        }
    }

    /// Close the cached handle
    pub fn invalidate(&mut self) {
        self.open = None;
    }

    /// Close the cached handle if it refers to `path` or anything below it
    pub fn invalidate_path(&mut self, path: &Path) {
        if self
            .open
            .as_ref()
            .map(|h| h.path.starts_with(path))
            .unwrap_or(false)
        {
            self.open = None;
        }
    }

    pub fn cached_path(&self) -> Option<&Path> {
        self.open.as_ref().map(|h| h.path.as_path())
    }

    fn handle(&mut self, path: &Path, need_write: bool) -> io::Result<&mut File> {
        let reusable = self
            .open
            .as_ref()
            .map(|h| h.path == path && (h.writable || !need_write))
            .unwrap_or(false);

        if !reusable {
            self.open = None;
            let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => (file, true),
                Err(e) if !need_write && e.kind() == io::ErrorKind::PermissionDenied => {
                    (File::open(path)?, false)
                }
                Err(e) => return Err(e),
            };
            self.open = Some(OpenHandle {
                path: path.to_path_buf(),
                file,
                writable,
            });
        }

        match self.open.as_mut() {
            Some(h) => Ok(&mut h.file),
            None => Err(io::Error::new(io::ErrorKind::Other, "handle not open")),
        }
    }

    /// Create or truncate `path` and keep the new handle
    pub fn create(&mut self, path: &Path) -> io::Result<()> {
        self.open = None;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.open = Some(OpenHandle {
            path: path.to_path_buf(),
            file,
            writable: true,
        });
        Ok(())
    }

    pub fn length(&mut self, path: &Path) -> io::Result<u64> {
        Ok(self.handle(path, false)?.metadata()?.len())
    }

    /// Read up to `buf.len()` bytes at `offset`; 0 at end of file
    pub fn read_at(&mut self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.handle(path, false)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn write_at(&mut self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = self.handle(path, true)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    /// Flush file contents to the card
    pub fn sync(&mut self) -> io::Result<()> {
        match self.open.as_mut() {
            Some(h) if h.writable => h.file.sync_all(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_at() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        let mut cache = HandleCache::new();

        cache.create(&path).unwrap();
        cache.write_at(&path, 0, b"hello world").unwrap();
        cache.write_at(&path, 6, b"WORLD").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(cache.read_at(&path, 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"WORLD");
        assert_eq!(cache.length(&path).unwrap(), 11);

        // Short read at end of file
        let mut tail = [0u8; 8];
        assert_eq!(cache.read_at(&path, 8, &mut tail).unwrap(), 3);
    }

    #[test]
    fn test_handle_reused_and_switched() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"aaaa").unwrap();
        std::fs::write(&b, b"bbbb").unwrap();

        let mut cache = HandleCache::new();
        let mut buf = [0u8; 4];
        cache.read_at(&a, 0, &mut buf).unwrap();
        assert_eq!(cache.cached_path(), Some(a.as_path()));

        cache.read_at(&b, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"bbbb");
        assert_eq!(cache.cached_path(), Some(b.as_path()));
    }

    #[test]
    fn test_generation_change_drops_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        cache.bind_generation(1);
        cache.length(&path).unwrap();
        assert!(cache.cached_path().is_some());

        cache.bind_generation(1);
        assert!(cache.cached_path().is_some());

        cache.bind_generation(2);
        assert!(cache.cached_path().is_none());
    }

    #[test]
    fn test_invalidate_path_prefix() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let path = sub.join("a.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        cache.length(&path).unwrap();

        cache.invalidate_path(&dir.path().join("other"));
        assert!(cache.cached_path().is_some());

        cache.invalidate_path(&sub);
        assert!(cache.cached_path().is_none());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut cache = HandleCache::new();
        let err = cache.length(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
