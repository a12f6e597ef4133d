//! Client path namespace
//!
//! Clients see POSIX-style absolute paths (`/a/b/c.txt`). On the card the same
//! entry lives under the media root. Translation is exact in both directions
//! once a path has been normalized.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Canonical client form: leading `/`, no empty or `.` segments, no trailing `/`
///
/// Example: `"a//b/./c/"` → `"/a/b/c"`, `""` → `"/"`
pub fn normalize(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidArgument(format!(
                    "Parent segments are not allowed: {}",
                    path
                )))
            }
            s if s.contains('\0') => {
                return Err(Error::InvalidArgument(format!("NUL in path: {:?}", path)))
            }
            s => segments.push(s),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Client path → native path under `root`
pub fn to_native(root: &Path, path: &str) -> Result<PathBuf> {
    let normalized = normalize(path)?;
    let mut native = root.to_path_buf();
    for segment in normalized.split('/').filter(|s| !s.is_empty()) {
        native.push(segment);
    }
    Ok(native)
}

/// Native path under `root` → client path
pub fn to_client(root: &Path, native: &Path) -> Result<String> {
    let relative = native.strip_prefix(root).map_err(|_| {
        Error::InvalidArgument(format!("{:?} is outside the card root {:?}", native, root))
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_string_lossy().into_owned()),
            Component::CurDir => {}
            other => {
                return Err(Error::InvalidArgument(format!(
                    "Unexpected path component {:?} in {:?}",
                    other, native
                )))
            }
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Parent directory of a client path; `None` for the root
pub fn parent(path: &str) -> Result<Option<String>> {
    let normalized = normalize(path)?;
    if normalized == "/" {
        return Ok(None);
    }

    Ok(Some(match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }))
}

/// Last segment of a client path; empty for the root
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Join a child name onto a client directory path
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{}/{}", dir, name.trim_start_matches('/'))
}

/// True when `path` names `file` at the root of the namespace, ignoring case
pub fn is_root_file(path: &str, file: &str) -> bool {
    path.trim_matches('/').eq_ignore_ascii_case(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("//a//./b/").unwrap(), "/a/b");
        assert!(normalize("/a/../b").is_err());
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn test_native_round_trip() {
        let root = Path::new("/mnt/sd");
        let native = to_native(root, "/profiles/slot 1.rt4").unwrap();
        assert_eq!(native, PathBuf::from("/mnt/sd/profiles/slot 1.rt4"));
        assert_eq!(to_client(root, &native).unwrap(), "/profiles/slot 1.rt4");

        assert_eq!(to_native(root, "/").unwrap(), PathBuf::from("/mnt/sd"));
        assert_eq!(to_client(root, root).unwrap(), "/");
    }

    #[test]
    fn test_outside_root_rejected() {
        let root = Path::new("/mnt/sd");
        assert!(to_client(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/").unwrap(), None);
        assert_eq!(parent("/a").unwrap(), Some("/".to_string()));
        assert_eq!(parent("/a/b/c.txt").unwrap(), Some("/a/b".to_string()));
        assert_eq!(parent("a/b/").unwrap(), Some("/a".to_string()));

        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("/a/b/"), "b");
        assert_eq!(file_name("/"), "");

        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a/", "x"), "/a/x");
    }

    #[test]
    fn test_root_file_match() {
        assert!(is_root_file("/wifi.ini", "wifi.ini"));
        assert!(is_root_file("/WiFi.INI", "wifi.ini"));
        assert!(!is_root_file("/sub/wifi.ini", "wifi.ini"));
    }
}
