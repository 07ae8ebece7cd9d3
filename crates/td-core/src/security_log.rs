//! Append-only security event log.
//!
//! Creator-exception approvals and other review-policy bypasses are recorded
//! as one JSON object per line in `.todos/security.jsonl`. The file is local
//! audit state and is never replicated.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::types::SecurityEvent;
use crate::DATA_DIR;

pub const SECURITY_LOG_FILE: &str = "security.jsonl";

pub struct SecurityLog {
    path: PathBuf,
}

impl SecurityLog {
    /// Log under `<project_dir>/.todos/security.jsonl`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self { path: project_dir.join(DATA_DIR).join(SECURITY_LOG_FILE) }
    }

    /// Log at an explicit path (tests).
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one event. Creates the file (and parent directory) on first
    /// write.
    pub fn append(&self, event: &SecurityEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        tracing::debug!(issue = %event.issue_id, session = %event.session_id, "security event recorded");
        Ok(())
    }

    /// Record a creator-exception approval.
    pub fn record_approval_bypass(
        &self,
        issue_id: &str,
        session_id: &str,
        agent_type: &str,
        reason: &str,
    ) -> std::io::Result<()> {
        self.append(&SecurityEvent {
            timestamp: Utc::now(),
            issue_id: issue_id.to_string(),
            session_id: session_id.to_string(),
            agent_type: agent_type.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Read all events. Unparseable lines are skipped.
    pub fn read_all(&self) -> std::io::Result<Vec<SecurityEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = SecurityLog::for_project(dir.path());

        log.record_approval_bypass("td-1", "s1", "claude", "looks good").unwrap();
        log.record_approval_bypass("td-2", "s1", "claude", "trivial fix").unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].issue_id, "td-1");
        assert_eq!(events[1].reason, "trivial fix");
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = SecurityLog::for_project(dir.path());
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let log = SecurityLog::at(path);
        log.record_approval_bypass("td-1", "s1", "terminal", "r").unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
    }
}
