//! Session identity.
//!
//! A session is an opaque, process-stable identifier for one working context
//! (a human terminal or an AI agent instance). Identity is derived once at
//! startup from a strategy stack and persisted to a per-session JSON file so
//! concurrent agents on the same checkout stay distinguishable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity sources
// ---------------------------------------------------------------------------

/// Where an identity came from, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Explicit `TD_SESSION_ID` override.
    Explicit,
    /// A known agent runtime advertised itself via its own env var.
    AgentEnv,
    /// A known orchestrator was found walking the process ancestry.
    ProcessAncestry,
    /// Terminal session environment.
    TerminalEnv,
    /// Git branch fallback.
    Branch,
}

/// Env var for the explicit override.
pub const SESSION_ID_ENV: &str = "TD_SESSION_ID";

/// Agent runtimes that advertise a session id directly: (agent name, env var).
const AGENT_ENV_VARS: &[(&str, &str)] = &[
    ("claude", "CLAUDE_SESSION_ID"),
    ("codex", "CODEX_SESSION_ID"),
    ("cursor", "CURSOR_SESSION_ID"),
    ("aider", "AIDER_SESSION_ID"),
];

/// Orchestrator process names recognized during the ancestor walk.
const ORCHESTRATOR_NAMES: &[&str] = &["claude", "codex", "cursor", "aider", "gemini", "goose"];

/// Terminal session env vars, in preference order.
const TERMINAL_ENV_VARS: &[&str] = &["TERM_SESSION_ID", "TMUX_PANE", "WINDOWID"];

// ---------------------------------------------------------------------------
// SessionIdentity
// ---------------------------------------------------------------------------

/// The resolved identity for this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub id: String,
    /// Short agent classifier ("claude", "terminal", "branch", ...).
    pub agent_type: String,
    pub source: IdentitySource,
    pub pid: u32,
    pub branch: String,
    pub started_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// Resolve identity via the strategy stack:
    /// explicit override -> agent env -> process ancestry -> terminal env ->
    /// branch fallback. Stable for the life of the process.
    pub fn resolve(branch: &str) -> Self {
        let pid = std::process::id();
        let branch = if branch.is_empty() { "main" } else { branch };

        if let Ok(id) = std::env::var(SESSION_ID_ENV) {
            if !id.trim().is_empty() {
                return Self::with("explicit", id.trim(), IdentitySource::Explicit, pid, branch);
            }
        }

        for (agent, var) in AGENT_ENV_VARS {
            if let Ok(val) = std::env::var(var) {
                if !val.trim().is_empty() {
                    let id = format!("{agent}-{}", short_fingerprint(val.trim()));
                    return Self::with(agent, &id, IdentitySource::AgentEnv, pid, branch);
                }
            }
        }

        if let Some((agent, agent_pid)) = find_orchestrator_ancestor(pid) {
            let id = format!("{agent}-{agent_pid}");
            return Self::with(&agent, &id, IdentitySource::ProcessAncestry, pid, branch);
        }

        for var in TERMINAL_ENV_VARS {
            if let Ok(val) = std::env::var(var) {
                if !val.trim().is_empty() {
                    let id = format!("term-{}", short_fingerprint(val.trim()));
                    return Self::with("terminal", &id, IdentitySource::TerminalEnv, pid, branch);
                }
            }
        }

        let id = format!("branch-{}", sanitize(branch));
        Self::with("branch", &id, IdentitySource::Branch, pid, branch)
    }

    fn with(agent_type: &str, id: &str, source: IdentitySource, pid: u32, branch: &str) -> Self {
        Self {
            id: id.to_string(),
            agent_type: agent_type.to_string(),
            source,
            pid,
            branch: branch.to_string(),
            started_at: Utc::now(),
        }
    }

    /// Path of this session's file: `<sessions>/<branch>/<agent>_<pid>.json`.
    pub fn file_path(&self, sessions_dir: &Path) -> PathBuf {
        sessions_dir
            .join(sanitize(&self.branch))
            .join(format!("{}_{}.json", sanitize(&self.agent_type), self.pid))
    }

    /// Persist the identity under the sessions directory.
    pub fn persist(&self, sessions_dir: &Path) -> std::io::Result<PathBuf> {
        let path = self.file_path(sessions_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        tracing::debug!(path = %path.display(), session = %self.id, "session file written");
        Ok(path)
    }

    /// Load a previously persisted identity. Returns `None` if missing or
    /// unparseable.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Filesystem-safe rendition of a branch or agent name.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// A short stable token from an arbitrary env value (uuid-ish or otherwise).
fn short_fingerprint(value: &str) -> String {
    let cleaned = sanitize(value);
    cleaned.chars().take(12).collect()
}

/// Walk the process ancestry looking for a known orchestrator name.
///
/// Linux-only: reads `/proc/<pid>/stat` for `(comm, ppid)`. Walks at most 16
/// levels so a cycle in a broken procfs cannot hang startup.
#[cfg(target_os = "linux")]
fn find_orchestrator_ancestor(start_pid: u32) -> Option<(String, u32)> {
    let mut pid = start_pid;
    for _ in 0..16 {
        let (comm, ppid) = read_proc_stat(pid)?;
        let name = comm.to_ascii_lowercase();
        if let Some(hit) = ORCHESTRATOR_NAMES.iter().find(|n| name.contains(*n)) {
            return Some((hit.to_string(), pid));
        }
        if ppid <= 1 {
            return None;
        }
        pid = ppid;
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn find_orchestrator_ancestor(_start_pid: u32) -> Option<(String, u32)> {
    None
}

/// Parse `comm` and `ppid` out of `/proc/<pid>/stat`.
///
/// The comm field is parenthesized and may itself contain spaces, so fields
/// are split after the closing paren.
#[cfg(target_os = "linux")]
fn read_proc_stat(pid: u32) -> Option<(String, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let rest = stat.get(close + 2..)?;
    let ppid: u32 = rest.split_whitespace().nth(1)?.parse().ok()?;
    Some((comm, ppid))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
