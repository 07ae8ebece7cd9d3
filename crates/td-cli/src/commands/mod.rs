//! Command implementations and the shared per-invocation context.

pub mod issue;
pub mod notes;
pub mod sync_cmd;
pub mod transition;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};

use td_core::config::Config;
use td_core::session::SessionIdentity;
use td_core::DATA_DIR;
use td_store::Store;
use td_server::webhook::{self, WebhookPayload};
use td_sync::autosync::{self, AutoSyncSettings};
use td_sync::{EventLog, LocalTransport, SyncClient};

/// Resolve the project directory from `-C` or the working directory.
pub fn project_dir(arg: Option<&str>) -> Result<PathBuf> {
    match arg {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => std::env::current_dir().context("cannot resolve working directory"),
    }
}

/// Current git branch, read straight from `.git/HEAD` (no git dependency).
/// Falls back to "main" outside a repository or on a detached head.
pub fn current_branch(dir: &Path) -> String {
    let head = dir.join(".git").join("HEAD");
    if let Ok(content) = std::fs::read_to_string(head) {
        if let Some(rest) = content.trim().strip_prefix("ref: refs/heads/") {
            return rest.to_string();
        }
    }
    "main".to_string()
}

/// Current commit SHA for the checked-out branch, if resolvable.
pub fn current_sha(dir: &Path) -> Option<String> {
    let git = dir.join(".git");
    let head = std::fs::read_to_string(git.join("HEAD")).ok()?;
    let head = head.trim();
    if let Some(reference) = head.strip_prefix("ref: ") {
        let sha = std::fs::read_to_string(git.join(reference)).ok()?;
        return Some(sha.trim().to_string()).filter(|s| !s.is_empty());
    }
    // Detached head: HEAD holds the SHA itself.
    Some(head.to_string()).filter(|s| !s.is_empty())
}

/// Startup auto-sync: runs one cooperative cycle before the command when
/// enabled, skipping the allow-listed commands and projects with no store.
pub async fn startup_auto_sync(dir: &Path, command: &str) {
    if autosync::skip_on_start(command) {
        return;
    }
    let Ok(ctx) = CliContext::open(dir).await else {
        return;
    };
    let settings = AutoSyncSettings::resolve(&ctx.config.sync);
    if !settings.enabled || !settings.on_start {
        return;
    }
    match ctx.sync_client().await {
        Ok(client) => autosync::run_after_mutation(&settings, &client, &ctx.store).await,
        Err(e) => tracing::debug!(error = %e, "startup sync unavailable"),
    }
}

/// Everything a command invocation needs: the opened store, the session
/// identity (persisted to its session file), and the resolved config.
pub struct CliContext {
    pub dir: PathBuf,
    pub store: Store,
    pub session: SessionIdentity,
    pub config: Config,
    /// Captured before the mutation so the webhook can batch exactly the
    /// actions this command produced.
    pub started_at: DateTime<Utc>,
}

impl CliContext {
    /// Open an existing project (errors when `td init` has not run).
    pub async fn open(dir: &Path) -> Result<Self> {
        let store = Store::open(dir)
            .await
            .with_context(|| format!("no td project in {} (run `td init`)", dir.display()))?;
        Self::with_store(dir, store).await
    }

    /// Initialize (or open) the project.
    pub async fn initialize(dir: &Path) -> Result<Self> {
        let store = Store::initialize(dir).await.context("initialize store")?;
        Self::with_store(dir, store).await
    }

    async fn with_store(dir: &Path, store: Store) -> Result<Self> {
        let config = Config::resolve(dir).unwrap_or_default();
        let session = SessionIdentity::resolve(&current_branch(dir));
        let sessions_dir = dir.join(DATA_DIR).join("sessions");
        if let Err(e) = session.persist(&sessions_dir) {
            tracing::debug!(error = %e, "session file write failed");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            session,
            config,
            started_at: Utc::now(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Project identifier: the directory's file name.
    pub fn project_id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".into())
    }

    /// Post-mutation hooks, in order: webhook dispatch, then auto-sync.
    /// Both are cooperative; failures are logged and swallowed.
    pub async fn after_mutation(&self) {
        self.dispatch_webhook().await;
        self.auto_sync().await;
    }

    /// Capture a git snapshot at a workflow boundary. Cooperative: outside a
    /// repository nothing is recorded.
    pub async fn record_git_snapshot(&self, issue_id: &str, event: td_core::types::GitEvent) {
        let Some(sha) = current_sha(&self.dir) else {
            return;
        };
        let snapshot = td_core::types::GitSnapshot {
            issue_id: issue_id.to_string(),
            event,
            commit_sha: sha,
            branch: current_branch(&self.dir),
            dirty_files: 0,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.record_git_snapshot_logged(&snapshot, self.session_id()).await {
            tracing::debug!(error = %e, "git snapshot failed");
        }
    }

    async fn dispatch_webhook(&self) {
        let (enabled, _) = td_core::features::resolve_with(&self.config, "webhook");
        if !enabled {
            return;
        }
        let Some(url) = self.config.webhook_url() else {
            return;
        };
        let actions = match self.store.actions_since(self.started_at).await {
            Ok(actions) if !actions.is_empty() => actions,
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(error = %e, "webhook batch query failed");
                return;
            }
        };
        let payload = WebhookPayload::from_actions(&self.project_id(), &actions);
        let secret = self.config.webhook_secret();
        if let Err(e) = webhook::dispatch_detached(&payload, &url, secret.as_deref()) {
            tracing::debug!(error = %e, "webhook dispatch failed");
        }
    }

    async fn auto_sync(&self) {
        let settings = AutoSyncSettings::resolve(&self.config.sync);
        if !settings.enabled {
            return;
        }
        match self.sync_client().await {
            Ok(client) => autosync::run_after_mutation(&settings, &client, &self.store).await,
            Err(e) => tracing::debug!(error = %e, "auto-sync client unavailable"),
        }
    }

    /// Sync client over the configured server, or the on-disk local event
    /// log (`.todos/sync.db`) when no server URL is set. The `sync` feature
    /// flag is the kill-switch-aware gate.
    pub async fn sync_client(&self) -> Result<SyncClient<Box<dyn td_sync::SyncTransport>>> {
        let (enabled, source) = td_core::features::resolve_with(&self.config, "sync");
        if !enabled {
            anyhow::bail!("sync is disabled ({source:?})");
        }
        let device = td_sync::client::device_id(&self.dir).context("device id")?;
        let transport: Box<dyn td_sync::SyncTransport> = match self.config.sync.server_url.clone() {
            Some(url) => Box::new(td_sync::HttpTransport::new(url, self.config.auth_key())),
            None => {
                let path = self.dir.join(DATA_DIR).join("sync.db");
                let log = EventLog::open(&path).await.context("open local event log")?;
                Box::new(LocalTransport::new(std::sync::Arc::new(log)))
            }
        };
        Ok(SyncClient::new(transport, self.project_id(), device))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_read_from_git_head() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(current_branch(dir.path()), "main");

        let git = dir.path().join(".git");
        std::fs::create_dir_all(&git).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/feature/sync\n").unwrap();
        assert_eq!(current_branch(dir.path()), "feature/sync");
    }

    #[test]
    fn sha_resolves_through_ref_and_detached_head() {
        let dir = tempfile::tempdir().unwrap();
        assert!(current_sha(dir.path()).is_none());

        let git = dir.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();
        assert_eq!(current_sha(dir.path()).as_deref(), Some("abc123"));

        std::fs::write(git.join("HEAD"), "deadbeef\n").unwrap();
        assert_eq!(current_sha(dir.path()).as_deref(), Some("deadbeef"));
    }
}
