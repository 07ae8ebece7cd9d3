//! Serve-port discovery file.
//!
//! When the HTTP server starts it binds to a possibly OS-assigned port and
//! writes a JSON file to `.todos/serve-port`. Consumers (CLI, other clients,
//! tests) read this file to discover the running server's address.
//!
//! ## Stale file recovery
//!
//! `read_valid()` checks whether the PID in the file is still alive via
//! `kill(pid, 0)`. If the process is dead, the stale file is removed
//! automatically and the next server can start cleanly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DATA_DIR;

pub const PORT_FILE: &str = "serve-port";

/// Runtime state written by the server after binding its listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortFile {
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub instance_id: Uuid,
}

impl PortFile {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            pid: std::process::id(),
            started_at: Utc::now(),
            instance_id: Uuid::new_v4(),
        }
    }

    /// Canonical path: `<project_dir>/.todos/serve-port`.
    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(DATA_DIR).join(PORT_FILE)
    }

    /// Publish the file, overwriting any previous instance.
    pub fn write(&self, project_dir: &Path) -> std::io::Result<()> {
        let path = Self::path(project_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        tracing::info!(port = self.port, pid = self.pid, "serve-port file written");
        Ok(())
    }

    /// Read the file. Returns `None` if missing or unparseable.
    pub fn read(project_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(project_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Read and validate liveness; stale files are removed.
    pub fn read_valid(project_dir: &Path) -> Option<Self> {
        let file = Self::read(project_dir)?;
        if pid_alive(file.pid) {
            Some(file)
        } else {
            tracing::info!(pid = file.pid, "removing stale serve-port file (process not running)");
            Self::remove(project_dir);
            None
        }
    }

    pub fn remove(project_dir: &Path) {
        let _ = std::fs::remove_file(Self::path(project_dir));
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(8123);
        file.write(dir.path()).unwrap();

        let read = PortFile::read(dir.path()).unwrap();
        assert_eq!(read.port, 8123);
        assert_eq!(read.pid, std::process::id());
        assert_eq!(read.base_url(), "http://127.0.0.1:8123");
    }

    #[test]
    fn live_pid_validates() {
        let dir = tempfile::tempdir().unwrap();
        PortFile::new(8124).write(dir.path()).unwrap();
        assert!(PortFile::read_valid(dir.path()).is_some());
    }

    #[test]
    fn stale_pid_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = PortFile::new(8125);
        file.pid = 4_000_000; // extremely unlikely to exist
        file.write(dir.path()).unwrap();

        assert!(PortFile::read_valid(dir.path()).is_none());
        assert!(!PortFile::path(dir.path()).exists());
    }

    #[test]
    fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PortFile::read(dir.path()).is_none());
    }
}
