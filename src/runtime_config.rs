// =============================================================================
// Runtime Configuration — the small mutable subset of config, persisted
// atomically on shutdown.
// =============================================================================
//
// Everything else (symbols, risk limits, strategy parameters) is static
// process configuration owned by `config::AppConfig`, loaded once at startup
// and never rewritten. `RuntimeConfig` is only the handful of fields the
// control API can flip while the engine runs: trading mode and account mode.
//
// Persistence uses the same atomic tmp + rename pattern as the rest of the
// Aurora lineage, to avoid corrupting the file if the process dies mid-write.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

/// The mutable subset of configuration: what a running engine can change
/// without a restart, and what gets written back on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { trading_mode: TradingMode::Paused, account_mode: AccountMode::Demo }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            account_mode = %config.account_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_paused_demo() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig { trading_mode: TradingMode::Live, account_mode: AccountMode::Live };
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.account_mode, cfg2.account_mode);
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("perpsim-runtime-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let cfg = RuntimeConfig { trading_mode: TradingMode::Killed, account_mode: AccountMode::Live };
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.trading_mode, TradingMode::Killed);
        assert_eq!(loaded.account_mode, AccountMode::Live);

        std::fs::remove_dir_all(&dir).ok();
    }
}
