//! `config` — core configuration, consumed read-only by every component.
//!
//! Loaded once at startup from `warden.toml` (plus `WARDEND_*` env overrides)
//! and validated before anything else runs. The five security enables default
//! to `true`; disabling audit logging or policy enforcement without the
//! explicit `allow_insecure_override` flag is a fatal startup error, never a
//! warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const DEFAULT_MAX_CONCURRENT_SANDBOXES: usize = 4;
const DEFAULT_ASK_TIMEOUT_SECS: u64 = 120;
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_AUTONOMY_LEVEL: u8 = 2;
const DEFAULT_AUDIT_ROTATE_ENTRIES: u64 = 10_000;

fn default_true() -> bool {
    true
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    /// A security layer was disabled without the override flag.
    #[error("refusing to start: {layer} is disabled and allow_insecure_override is not set")]
    InsecureWithoutOverride { layer: &'static str },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

// ─── CoreConfig ───────────────────────────────────────────────────────────────

/// Top-level configuration for the mediation core.
///
/// All security enables default to on. `data_dir` holds the vault file, the
/// policy rules file, and the audit log segments.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root directory for vault, rules, and audit segments.
    pub data_dir: PathBuf,

    /// Execute approved tools inside an isolation backend.
    #[serde(default = "default_true")]
    pub sandbox_enabled: bool,
    /// Evaluate every request against the rule set before execution.
    #[serde(default = "default_true")]
    pub policy_engine_enabled: bool,
    /// Mint and check session canary markers.
    #[serde(default = "default_true")]
    pub canary_tokens_enabled: bool,
    /// Inspect sandbox output for credential leaks and host violations.
    #[serde(default = "default_true")]
    pub egress_filtering_enabled: bool,
    /// Append every decision and action to the hash-chained audit log.
    #[serde(default = "default_true")]
    pub audit_logging_enabled: bool,

    /// High-friction escape hatch. Required to disable any security layer.
    pub allow_insecure_override: bool,

    /// Maximum sandboxed executions in flight; calls beyond this queue.
    pub max_concurrent_sandboxes: usize,
    /// How long an AskUser decision may stay pending before resolving to Deny.
    pub ask_timeout_secs: u64,
    /// How long a call may wait for a sandbox slot before resolving to Busy.
    pub sandbox_queue_timeout_secs: u64,
    /// Session autonomy dial (0 = ask everything … 4 = auto all but credentials).
    pub autonomy_level: u8,
    /// Entries per audit segment before rotation starts a new chained file.
    pub audit_rotate_entries: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sandbox_enabled: true,
            policy_engine_enabled: true,
            canary_tokens_enabled: true,
            egress_filtering_enabled: true,
            audit_logging_enabled: true,
            allow_insecure_override: false,
            max_concurrent_sandboxes: DEFAULT_MAX_CONCURRENT_SANDBOXES,
            ask_timeout_secs: DEFAULT_ASK_TIMEOUT_SECS,
            sandbox_queue_timeout_secs: DEFAULT_QUEUE_TIMEOUT_SECS,
            autonomy_level: DEFAULT_AUTONOMY_LEVEL,
            audit_rotate_entries: DEFAULT_AUDIT_ROTATE_ENTRIES,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

impl CoreConfig {
    /// Load config from a TOML file, falling back to defaults when the file
    /// does not exist. A present-but-unparseable file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        Ok(config.apply_env())
    }

    /// Apply `WARDEND_*` environment overrides on top of file values.
    fn apply_env(mut self) -> Self {
        if let Some(dir) = std::env::var_os("WARDEND_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("WARDEND_AUTONOMY") {
            match level.parse::<u8>() {
                Ok(v) if v <= 4 => self.autonomy_level = v,
                _ => warn!(value = %level, "ignoring invalid WARDEND_AUTONOMY"),
            }
        }
        self
    }

    /// Fail-closed validation, called once before any component starts.
    ///
    /// Disabling audit logging or policy enforcement is fatal unless the
    /// operator set `allow_insecure_override`. Other layers may be disabled
    /// with the override too; without it they are also refused.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.allow_insecure_override {
            if !self.audit_logging_enabled {
                return Err(ConfigError::InsecureWithoutOverride {
                    layer: "audit logging",
                });
            }
            if !self.policy_engine_enabled {
                return Err(ConfigError::InsecureWithoutOverride {
                    layer: "policy enforcement",
                });
            }
            if !self.sandbox_enabled {
                return Err(ConfigError::InsecureWithoutOverride { layer: "sandbox" });
            }
            if !self.canary_tokens_enabled {
                return Err(ConfigError::InsecureWithoutOverride {
                    layer: "canary tokens",
                });
            }
            if !self.egress_filtering_enabled {
                return Err(ConfigError::InsecureWithoutOverride {
                    layer: "egress filtering",
                });
            }
        }

        if self.max_concurrent_sandboxes == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sandboxes must be at least 1".to_string(),
            ));
        }
        if self.autonomy_level > 4 {
            return Err(ConfigError::Invalid(format!(
                "autonomy_level must be 0..=4, got {}",
                self.autonomy_level
            )));
        }
        Ok(())
    }

    /// Path of the encrypted vault file.
    pub fn vault_path(&self) -> PathBuf {
        self.data_dir.join("vault.enc")
    }

    /// Path of the user policy rules file.
    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join("policies").join("rules.json")
    }

    /// Directory holding audit log segments.
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_enabled() {
        let c = CoreConfig::default();
        assert!(c.sandbox_enabled);
        assert!(c.policy_engine_enabled);
        assert!(c.canary_tokens_enabled);
        assert!(c.egress_filtering_enabled);
        assert!(c.audit_logging_enabled);
        assert!(!c.allow_insecure_override);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn disabling_audit_without_override_is_fatal() {
        let c = CoreConfig {
            audit_logging_enabled: false,
            ..CoreConfig::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InsecureWithoutOverride { layer: "audit logging" })
        ));
    }

    #[test]
    fn disabling_policy_without_override_is_fatal() {
        let c = CoreConfig {
            policy_engine_enabled: false,
            ..CoreConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn override_permits_disabled_layers() {
        let c = CoreConfig {
            egress_filtering_enabled: false,
            allow_insecure_override: true,
            ..CoreConfig::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_sandbox_slots_rejected() {
        let c = CoreConfig {
            max_concurrent_sandboxes: 0,
            ..CoreConfig::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let c = CoreConfig::load(Path::new("/nonexistent/warden.toml")).expect("load");
        assert!(c.audit_logging_enabled);
    }
}
