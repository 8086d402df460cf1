//! `doctor` — operational health checks.
//!
//! Verifies the things an operator cares about before trusting a host: the
//! config gate, the isolation backends actually available, the vault file,
//! and the full audit chain. Run via `wardend doctor`.

use serde::Serialize;

use crate::audit::{load_entries, verify_entries, GENESIS};
use crate::config::CoreConfig;
use crate::sandbox::probe_backends;
use crate::vault::SecretsVault;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

pub fn run_doctor(config: &CoreConfig) -> DoctorReport {
    let mut checks = Vec::new();

    // Config gate: the five enables plus override discipline.
    checks.push(match config.validate() {
        Ok(()) => DoctorCheck {
            name: "config",
            ok: true,
            detail: "all security layers enabled".to_string(),
        },
        Err(e) => DoctorCheck {
            name: "config",
            ok: false,
            detail: e.to_string(),
        },
    });

    // Data directory must be creatable/writable.
    checks.push(match std::fs::create_dir_all(&config.data_dir) {
        Ok(()) => DoctorCheck {
            name: "data_dir",
            ok: true,
            detail: config.data_dir.display().to_string(),
        },
        Err(e) => DoctorCheck {
            name: "data_dir",
            ok: false,
            detail: format!("{}: {}", config.data_dir.display(), e),
        },
    });

    // Sandbox backends, most isolated first.
    let backends = probe_backends();
    let names: Vec<String> = backends.iter().map(|b| b.to_string()).collect();
    checks.push(DoctorCheck {
        name: "sandbox_backends",
        // The process fallback always exists; flag when it is all we have.
        ok: backends.len() > 1 || !config.sandbox_enabled,
        detail: names.join(" > "),
    });

    // Vault presence (not unlocked here; doctor never reads secrets).
    let vault = SecretsVault::new(config.vault_path());
    checks.push(DoctorCheck {
        name: "vault",
        ok: true,
        detail: if vault.is_initialized() {
            "initialized (locked)".to_string()
        } else {
            "not initialized — run 'wardend vault init'".to_string()
        },
    });

    // Full audit chain verification.
    checks.push(match load_entries(&config.audit_dir()) {
        Ok(entries) => {
            let report = verify_entries(&entries, GENESIS);
            DoctorCheck {
                name: "audit_chain",
                ok: report.valid,
                detail: report.message,
            }
        }
        Err(e) => DoctorCheck {
            name: "audit_chain",
            ok: false,
            detail: e.to_string(),
        },
    });

    // Policy rules parse (fail-closed check without starting the engine).
    checks.push(
        match crate::policy::RuleSet::load(&config.rules_path()) {
            Ok(rules) => DoctorCheck {
                name: "policy_rules",
                ok: true,
                detail: format!("{} user rules loaded", rules.len()),
            },
            Err(e) => DoctorCheck {
                name: "policy_rules",
                ok: false,
                detail: e.to_string(),
            },
        },
    );

    DoctorReport { checks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> CoreConfig {
        CoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..CoreConfig::default()
        }
    }

    #[test]
    fn fresh_host_reports() {
        let dir = TempDir::new().expect("tempdir");
        let report = run_doctor(&config_in(&dir));

        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert!(names.contains(&"config"));
        assert!(names.contains(&"audit_chain"));
        assert!(names.contains(&"vault"));

        let audit = report
            .checks
            .iter()
            .find(|c| c.name == "audit_chain")
            .expect("audit check");
        assert!(audit.ok, "empty chain verifies: {}", audit.detail);
    }

    #[test]
    fn disabled_audit_fails_config_check() {
        let dir = TempDir::new().expect("tempdir");
        let config = CoreConfig {
            audit_logging_enabled: false,
            ..config_in(&dir)
        };
        let report = run_doctor(&config);
        let config_check = report
            .checks
            .iter()
            .find(|c| c.name == "config")
            .expect("config check");
        assert!(!config_check.ok);
    }
}
