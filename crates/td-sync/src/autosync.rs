//! The auto-sync hook.
//!
//! Mutating commands trigger a cooperative background sync. A process-wide
//! guarded record (compare-and-swap in-flight flag plus a last-run stamp)
//! prevents concurrent cycles and debounces bursts; failures are logged at
//! debug level and swallowed so command latency never depends on the
//! network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use td_core::config::SyncConfig;
use td_core::features::KILL_SWITCH_ENV;
use td_store::Store;

use crate::client::SyncClient;
use crate::transport::SyncTransport;

pub const AUTO_ENV: &str = "TD_SYNC_AUTO";
pub const DEBOUNCE_ENV: &str = "TD_SYNC_AUTO_DEBOUNCE";
pub const INTERVAL_ENV: &str = "TD_SYNC_AUTO_INTERVAL";
pub const PULL_ENV: &str = "TD_SYNC_AUTO_PULL";
pub const ON_START_ENV: &str = "TD_SYNC_AUTO_START";

/// Commands that never trigger the startup auto-sync. `webhook-send` is the
/// internal delivery child and must not recurse into sync work.
pub const STARTUP_SKIP_COMMANDS: &[&str] =
    &["sync", "auth", "login", "version", "help", "webhook-send"];

/// Returns `true` when the startup sync should be skipped for `command`.
pub fn skip_on_start(command: &str) -> bool {
    STARTUP_SKIP_COMMANDS.iter().any(|c| *c == command)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSyncSettings {
    pub enabled: bool,
    /// Minimum gap between mutation-triggered syncs.
    pub debounce: Duration,
    /// Periodic background cycle (used by the server heartbeat).
    pub interval: Duration,
    pub pull: bool,
    pub on_start: bool,
}

impl AutoSyncSettings {
    /// Resolve from config with env overrides; the kill switch disables
    /// everything.
    pub fn resolve(config: &SyncConfig) -> Self {
        if env_truthy(KILL_SWITCH_ENV) {
            return Self {
                enabled: false,
                debounce: Duration::from_secs(config.debounce_secs),
                interval: Duration::from_secs(config.interval_secs),
                pull: config.pull,
                on_start: false,
            };
        }
        Self {
            enabled: env_bool(AUTO_ENV).unwrap_or(config.auto),
            debounce: env_duration(DEBOUNCE_ENV)
                .unwrap_or(Duration::from_secs(config.debounce_secs)),
            interval: env_duration(INTERVAL_ENV)
                .unwrap_or(Duration::from_secs(config.interval_secs)),
            pull: env_bool(PULL_ENV).unwrap_or(config.pull),
            on_start: env_bool(ON_START_ENV).unwrap_or(config.on_start),
        }
    }
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var).is_ok_and(|v| !v.trim().is_empty())
}

fn env_bool(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(!matches!(raw, "0" | "false" | "off" | "no"))
}

/// Parse `3s`, `500ms`, `5m`, or bare seconds.
fn env_duration(var: &str) -> Option<Duration> {
    parse_duration(std::env::var(var).ok()?.trim())
}

fn parse_duration(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = raw.strip_suffix('m') {
        return mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    raw.parse().ok().map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Process-wide guard
// ---------------------------------------------------------------------------

/// The in-flight flag and last-run stamp, shared by every hook invocation in
/// this process.
pub struct AutoSyncState {
    in_flight: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

impl AutoSyncState {
    pub const fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static AutoSyncState {
        static GLOBAL: OnceLock<AutoSyncState> = OnceLock::new();
        GLOBAL.get_or_init(AutoSyncState::new)
    }

    /// Claim the in-flight slot if no cycle is running and the debounce
    /// window has elapsed. The returned guard releases the slot and stamps
    /// the last-run time on drop.
    pub fn try_begin(&self, debounce: Duration) -> Option<AutoSyncGuard<'_>> {
        {
            let last = self.last_run.lock().expect("auto-sync lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < debounce {
                    return None;
                }
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        Some(AutoSyncGuard { state: self })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for AutoSyncState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AutoSyncGuard<'a> {
    state: &'a AutoSyncState,
}

impl Drop for AutoSyncGuard<'_> {
    fn drop(&mut self) {
        let mut last = self.state.last_run.lock().expect("auto-sync lock poisoned");
        *last = Some(Instant::now());
        self.state.in_flight.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// The hook
// ---------------------------------------------------------------------------

/// Run one auto-sync cycle if enabled, not in flight, and past the debounce.
/// Cooperative: every failure is logged and swallowed.
pub async fn run_after_mutation<T: SyncTransport>(
    settings: &AutoSyncSettings,
    client: &SyncClient<T>,
    store: &Store,
) {
    if !settings.enabled {
        return;
    }
    let Some(_guard) = AutoSyncState::global().try_begin(settings.debounce) else {
        tracing::debug!("auto-sync skipped (in flight or debounced)");
        return;
    };
    let outcome = if settings.pull {
        client.sync_once(store).await
    } else {
        client.push(store).await
    };
    match outcome {
        Ok(summary) => tracing::debug!(
            pushed = summary.pushed,
            applied = summary.applied,
            "auto-sync complete"
        ),
        Err(e) => tracing::debug!(error = %e, "auto-sync failed (ignored)"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_allow_list() {
        for cmd in ["sync", "auth", "login", "version", "help", "webhook-send"] {
            assert!(skip_on_start(cmd));
        }
        assert!(!skip_on_start("create"));
        assert!(!skip_on_start("close"));
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn cas_admits_exactly_one() {
        let state = AutoSyncState::new();
        let guard = state.try_begin(Duration::ZERO);
        assert!(guard.is_some());
        assert!(state.is_in_flight());
        // Second claim while the first is held fails.
        assert!(state.try_begin(Duration::ZERO).is_none());
        drop(guard);
        assert!(!state.is_in_flight());
    }

    #[test]
    fn debounce_blocks_until_elapsed() {
        let state = AutoSyncState::new();
        drop(state.try_begin(Duration::ZERO).unwrap()); // stamps last_run
        assert!(state.try_begin(Duration::from_secs(60)).is_none());
        assert!(state.try_begin(Duration::ZERO).is_some());
    }

    #[test]
    fn settings_default_from_config() {
        // Only assert pure config resolution when no env overrides are set
        // in the environment running the tests.
        if std::env::var(AUTO_ENV).is_ok() || std::env::var(KILL_SWITCH_ENV).is_ok() {
            return;
        }
        let config = SyncConfig::default();
        let settings = AutoSyncSettings::resolve(&config);
        assert!(!settings.enabled);
        assert_eq!(settings.debounce, Duration::from_secs(3));
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert!(settings.pull);
    }
}
