//! Inbox intake: validated files move from `Inbox/` to `Needs_Action/`.

use serde_json::json;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::alerts::ErrorManager;
use crate::audit::{AuditLogger, AuditResult};
use crate::error::VaultError;
use crate::vault::{file_name, list_files, Location, MoveOutcome, Vault, VaultState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub accepted: usize,
    pub quarantined: usize,
    /// Still being written; retried next poll
    pub unsettled: usize,
}

pub struct InboxWatcher {
    vault: Vault,
    audit: AuditLogger,
    errors: ErrorManager,
    settle: Duration,
}

impl InboxWatcher {
    pub fn new(vault: Vault, audit: AuditLogger, errors: ErrorManager, settle: Duration) -> Self {
        Self {
            vault,
            audit,
            errors,
            settle,
        }
    }

    pub fn run_cycle(&self) -> Result<IntakeReport, VaultError> {
        let mut report = IntakeReport::default();
        for path in list_files(&self.vault.dir(VaultState::Inbox), |_| true)? {
            let name = file_name(&path)?;
            if !self.settled(&path) {
                debug!(file = %name, "not settled yet");
                report.unsettled += 1;
                continue;
            }

            if let Err(reason) = validate(&path, &name) {
                if self.errors.quarantine(&path, &reason)?.is_some() {
                    report.quarantined += 1;
                }
                continue;
            }

            if let MoveOutcome::Moved(dest) = self
                .vault
                .transition(&path, &Location::of(VaultState::NeedsAction))?
            {
                info!(file = %name, "task accepted from inbox");
                self.audit.log_best_effort(
                    "intake_task",
                    &name,
                    json!({"path": dest.display().to_string()}),
                    AuditResult::Success,
                );
                report.accepted += 1;
            }
        }
        Ok(report)
    }

    fn settled(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age >= self.settle)
            .unwrap_or(false)
    }
}

/// A task must be non-empty UTF-8 markdown
fn validate(path: &Path, name: &str) -> Result<(), String> {
    if !name.ends_with(".md") {
        return Err(format!("unsupported file type: {}", name));
    }
    let bytes = fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    let text = String::from_utf8(bytes).map_err(|_| "not valid UTF-8".to_string())?;
    if text.trim().is_empty() {
        return Err("empty file".to_string());
    }
    Ok(())
}
