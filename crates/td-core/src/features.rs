//! Feature flags.
//!
//! Flags resolve through a fixed precedence chain; `resolve` is the sole
//! read path so every caller observes the same layering:
//!
//! 1. `TD_DISABLE_EXPERIMENTAL` kill switch (everything off)
//! 2. `TD_FEATURE_<NAME>` per-feature env
//! 3. `TD_ENABLE_FEATURE` / `TD_DISABLE_FEATURE` comma lists (disable wins)
//! 4. Project config `features` map
//! 5. Declared default

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Config;

pub const KILL_SWITCH_ENV: &str = "TD_DISABLE_EXPERIMENTAL";
pub const ENABLE_LIST_ENV: &str = "TD_ENABLE_FEATURE";
pub const DISABLE_LIST_ENV: &str = "TD_DISABLE_FEATURE";

/// Which layer decided the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    KillSwitch,
    FeatureEnv,
    ListEnv,
    ProjectConfig,
    Default,
}

/// Declared features and their defaults.
pub const DECLARED: &[(&str, bool)] = &[
    ("sync", true),
    ("auto_sync", false),
    ("webhook", true),
    ("boards", true),
];

fn declared_default(name: &str) -> bool {
    DECLARED
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, d)| *d)
        .unwrap_or(false)
}

fn list_contains(list: &str, name: &str) -> bool {
    list.split(',').any(|item| item.trim().eq_ignore_ascii_case(name))
}

/// Resolve `name` for the project at `dir`.
pub fn resolve(dir: &Path, name: &str) -> (bool, FlagSource) {
    let config = Config::resolve(dir).unwrap_or_default();
    resolve_with(&config, name)
}

/// Resolve against an already-loaded config (avoids re-reading files in
/// loops and makes the chain testable).
pub fn resolve_with(config: &Config, name: &str) -> (bool, FlagSource) {
    if std::env::var(KILL_SWITCH_ENV).is_ok_and(|v| !v.trim().is_empty()) {
        return (false, FlagSource::KillSwitch);
    }

    let per_feature = format!("TD_FEATURE_{}", name.to_ascii_uppercase());
    if let Ok(val) = std::env::var(&per_feature) {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            let enabled = !matches!(trimmed, "0" | "false" | "off" | "no");
            return (enabled, FlagSource::FeatureEnv);
        }
    }

    // Disable wins over enable when a feature appears in both lists.
    let disabled = std::env::var(DISABLE_LIST_ENV)
        .map(|l| list_contains(&l, name))
        .unwrap_or(false);
    if disabled {
        return (false, FlagSource::ListEnv);
    }
    let enabled = std::env::var(ENABLE_LIST_ENV)
        .map(|l| list_contains(&l, name))
        .unwrap_or(false);
    if enabled {
        return (true, FlagSource::ListEnv);
    }

    if let Some(v) = config.features.get(name) {
        return (*v, FlagSource::ProjectConfig);
    }

    (declared_default(name), FlagSource::Default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        std::env::remove_var(KILL_SWITCH_ENV);
        std::env::remove_var(ENABLE_LIST_ENV);
        std::env::remove_var(DISABLE_LIST_ENV);
        std::env::remove_var("TD_FEATURE_SYNC");
        std::env::remove_var("TD_FEATURE_BOARDS");
    }

    /// Env-var layering is process-global, so the precedence cases run
    /// sequentially inside one test.
    #[test]
    fn precedence_chain() {
        clear_env();
        let config = Config::default();

        // 5: declared default
        assert_eq!(resolve_with(&config, "sync"), (true, FlagSource::Default));
        assert_eq!(resolve_with(&config, "auto_sync"), (false, FlagSource::Default));
        assert_eq!(resolve_with(&config, "unknown"), (false, FlagSource::Default));

        // 4: project config
        let mut config = Config::default();
        config.features.insert("sync".into(), false);
        assert_eq!(resolve_with(&config, "sync"), (false, FlagSource::ProjectConfig));

        // 3: lists — disable wins over enable
        std::env::set_var(ENABLE_LIST_ENV, "sync,boards");
        assert_eq!(resolve_with(&config, "sync"), (true, FlagSource::ListEnv));
        std::env::set_var(DISABLE_LIST_ENV, "sync");
        assert_eq!(resolve_with(&config, "sync"), (false, FlagSource::ListEnv));

        // 2: per-feature env
        std::env::set_var("TD_FEATURE_SYNC", "on");
        assert_eq!(resolve_with(&config, "sync"), (true, FlagSource::FeatureEnv));
        std::env::set_var("TD_FEATURE_SYNC", "false");
        assert_eq!(resolve_with(&config, "sync"), (false, FlagSource::FeatureEnv));

        // 1: kill switch beats everything
        std::env::set_var("TD_FEATURE_SYNC", "on");
        std::env::set_var(KILL_SWITCH_ENV, "1");
        assert_eq!(resolve_with(&config, "sync"), (false, FlagSource::KillSwitch));

        clear_env();
    }

    #[test]
    fn list_matching_is_case_insensitive_and_trimmed() {
        assert!(list_contains("a, SYNC ,b", "sync"));
        assert!(!list_contains("sy,nc", "sync"));
    }
}
