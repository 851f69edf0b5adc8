//! Optional persistence of shared screenshots

use chrono::Local;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

const ILLEGAL_FILENAME_CHARS: &str = "\\/:*?\"<>|";

/// Destination for screenshots that clients share
pub trait ScreenshotSink: Send + Sync {
    fn save(&self, username: &str, bytes: &[u8]);
}

/// Writes each screenshot as `<dir>/<username> <timestamp>.png`
///
/// Failures are logged and swallowed; an existing file is never overwritten.
#[derive(Debug, Clone)]
pub struct DirectoryScreenshotSink {
    dir: PathBuf,
}

impl DirectoryScreenshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a screenshot taken now by `username`
    pub fn file_path(&self, username: &str) -> PathBuf {
        let name: String = username
            .chars()
            .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(*c))
            .collect();
        let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
        self.dir.join(format!("{} {}.png", name, stamp))
    }
}

impl ScreenshotSink for DirectoryScreenshotSink {
    fn save(&self, username: &str, bytes: &[u8]) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Could not create screenshot directory {:?}: {}", self.dir, e);
            return;
        }

        let path = self.file_path(username);
        if path.exists() {
            debug!("Screenshot {:?} already exists, skipping", path);
            return;
        }

        if let Err(e) = fs::write(&path, bytes) {
            warn!("Could not save screenshot {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_characters_removed() {
        let sink = DirectoryScreenshotSink::new("shots");
        let path = sink.file_path("a/b:c*d?\"e<f>g|h\\i");
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(file_name.starts_with("abcdefghi "));
        assert!(file_name.ends_with(".png"));
        assert_eq!(path.parent().unwrap(), Path::new("shots"));
    }

    #[test]
    fn test_save_creates_directory() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested").join("shots");
        let sink = DirectoryScreenshotSink::new(&dir);

        sink.save("alice", &[0x89, b'P', b'N', b'G']);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let saved = fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(saved, vec![0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_existing_file_not_overwritten() {
        let temp = tempfile::tempdir().unwrap();
        let sink = DirectoryScreenshotSink::new(temp.path());

        let path = sink.file_path("bob");
        fs::write(&path, b"original").unwrap();
        sink.save("bob", b"replacement");

        // The timestamp may have ticked over; only check the pre-existing file
        assert_eq!(fs::read(&path).unwrap(), b"original");
    }
}
