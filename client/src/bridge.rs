//! File exchange with the external application
//!
//! The application and the client talk through three files in a shared
//! directory:
//!
//! | File             | Written by  | Contents                                   |
//! |------------------|-------------|--------------------------------------------|
//! | `out.txt`        | application | `[u32 format version][one update]`         |
//! | `in.txt`         | client      | `[u32 format version][updates, appended]`  |
//! | `clientdata.txt` | client      | the username, once per session             |
//!
//! Either side may hold a file briefly, so every operation tolerates a
//! missing or unreadable file and reports nothing rather than waiting.

use log::{debug, warn};
use shared::FILE_FORMAT_VERSION;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

pub const OUT_FILENAME: &str = "out.txt";
pub const IN_FILENAME: &str = "in.txt";
pub const CLIENT_DATA_FILENAME: &str = "clientdata.txt";

const VERSION_HEADER_LENGTH: usize = 4;

#[derive(Debug, Clone)]
pub struct PluginBridge {
    dir: PathBuf,
}

impl PluginBridge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn out_path(&self) -> PathBuf {
        self.dir.join(OUT_FILENAME)
    }

    pub fn in_path(&self) -> PathBuf {
        self.dir.join(IN_FILENAME)
    }

    pub fn client_data_path(&self) -> PathBuf {
        self.dir.join(CLIENT_DATA_FILENAME)
    }

    /// Creates the directory, drops leftovers of a previous session and
    /// hands the username to the application
    pub fn start_session(&self, username: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        self.clear_stale();
        self.write_username(username)
    }

    pub fn write_username(&self, username: &str) -> io::Result<()> {
        fs::write(self.client_data_path(), username.as_bytes())
    }

    /// Removes `in.txt` and `out.txt`, ignoring failures
    pub fn clear_stale(&self) {
        for path in [self.in_path(), self.out_path()] {
            remove_quietly(&path);
        }
    }

    pub fn end_session(&self) {
        remove_quietly(&self.client_data_path());
    }

    /// Consumes the pending outgoing update, returning it without its version header
    ///
    /// Yields `None` when there is no update, the file cannot be read right
    /// now, or it was written by an incompatible application version.
    pub fn take_outgoing(&self) -> Option<Vec<u8>> {
        let path = self.out_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!("Could not read {:?}: {}", path, e);
                return None;
            }
        };
        remove_quietly(&path);

        if bytes.len() < VERSION_HEADER_LENGTH {
            warn!("Discarding truncated update of {} bytes", bytes.len());
            return None;
        }

        let mut version = [0u8; VERSION_HEADER_LENGTH];
        version.copy_from_slice(&bytes[..VERSION_HEADER_LENGTH]);
        let version = u32::from_le_bytes(version);
        if version != FILE_FORMAT_VERSION {
            warn!(
                "Plugin version is incompatible with client version! (file format {}, expected {})",
                version, FILE_FORMAT_VERSION
            );
            return None;
        }

        Some(bytes[VERSION_HEADER_LENGTH..].to_vec())
    }

    /// True while the application has not yet consumed the last delivery
    pub fn incoming_pending(&self) -> bool {
        self.in_path().exists()
    }

    /// Writes `updates` into `in.txt` behind the version header
    ///
    /// Returns false without writing when the previous delivery is still
    /// pending.
    pub fn deliver_incoming(&self, updates: &[Vec<u8>]) -> io::Result<bool> {
        if self.incoming_pending() {
            return Ok(false);
        }

        let total: usize = updates.iter().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(VERSION_HEADER_LENGTH + total);
        bytes.extend_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
        for update in updates {
            bytes.extend_from_slice(update);
        }

        fs::write(self.in_path(), bytes)?;
        Ok(true)
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {:?}: {}", path, e),
    }
}
