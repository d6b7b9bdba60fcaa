//! Failure escalation: retries, FAILURE reports, CRITICAL alerts and quarantine.
//!
//! Every failed action ends in exactly one of three artifacts:
//!
//! | Outcome | Artifact |
//! |---|---|
//! | retries exhausted / sensitive single attempt | `Alerts/FAILURE_{action}_{ts}.md` + queue row |
//! | auth or permission error | `Alerts/CRITICAL_ALERT_{ts}.md` |
//! | structural problem with the file | `Quarantine/<name>` + `<name>.report` |
//!
//! The audit entry that pairs with the artifact is written by the caller, which
//! knows the approval context. Quarantine writes its own entry because the
//! file leaves the normal flow there.

use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::{AuditLogger, AuditResult};
use crate::error::{ActionError, VaultError};
use crate::retry::{classify, is_sensitive_action, ErrorClass, RetryPolicy, Sleeper, TokioSleeper};
use crate::vault::{file_name, timestamp, timestamp_micros, Location, MoveOutcome, Vault, VaultState};

pub const FAILED_QUEUE: &str = "Failed_Actions_Queue.md";

const QUEUE_HEADER: &str = "# Failed Actions Queue\n\n\
| Timestamp | Action | Error | Status | Report |\n\
|---|---|---|---|---|\n";

/// Where a failure was reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    FailureReport(PathBuf),
    CriticalAlert(PathBuf),
    /// Structural failure; the caller quarantines the offending file
    Quarantine,
    /// Writing the report itself failed; only tracing has it
    Unreported,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{action} failed after {attempts} attempt(s): {error}")]
pub struct ActionFailure {
    pub action: String,
    pub error: ActionError,
    pub class: ErrorClass,
    pub attempts: u32,
    pub escalation: Escalation,
}

#[derive(Clone)]
pub struct ErrorManager {
    vault: Vault,
    audit: AuditLogger,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ErrorManager {
    pub fn new(vault: Vault, audit: AuditLogger, policy: RetryPolicy) -> Self {
        Self {
            vault,
            audit,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the retry policy and escalate the final failure.
    ///
    /// Sensitive actions get one attempt. Auth errors stop immediately with a
    /// CRITICAL alert. Structural errors stop immediately and leave quarantine
    /// to the caller.
    pub async fn run<T, F, Fut>(
        &self,
        action: &str,
        context: &Value,
        op: F,
    ) -> Result<T, ActionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        self.run_as(action, is_sensitive_action(action), context, op)
            .await
    }

    /// [`run`](Self::run) with the sensitivity decided by the caller, e.g.
    /// from the tool an action goes through rather than its name
    pub async fn run_as<T, F, Fut>(
        &self,
        action: &str,
        sensitive: bool,
        context: &Value,
        mut op: F,
    ) -> Result<T, ActionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        let max_attempts = if sensitive { 1 } else { self.policy.max_attempts.max(1) };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(action, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify(&err);
            let escalation = match class {
                ErrorClass::Auth => {
                    error!(action, error = %err, "authentication failure, not retrying");
                    self.escalate(self.critical_alert(action, &err.to_string()))
                }
                ErrorClass::Structural => {
                    warn!(action, error = %err, "structural failure, not retrying");
                    Escalation::Quarantine
                }
                ErrorClass::Transient if attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        action,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    continue;
                }
                ErrorClass::Transient => {
                    if sensitive {
                        warn!(action, error = %err, "sensitive action failed, auto-retry skipped");
                    } else {
                        error!(action, attempts = attempt, error = %err, "retries exhausted");
                    }
                    self.escalate(self.failure_report(action, &err.to_string(), attempt, context))
                }
            };

            return Err(ActionFailure {
                action: action.to_string(),
                error: err,
                class,
                attempts: attempt,
                escalation,
            });
        }
    }

    fn escalate(&self, written: Result<Escalation, VaultError>) -> Escalation {
        written.unwrap_or_else(|e| {
            error!(error = %e, "failed to write escalation report");
            Escalation::Unreported
        })
    }

    /// Write `FAILURE_{action}_{ts}.md` and its row in the failed-actions queue
    pub fn failure_report(
        &self,
        action: &str,
        message: &str,
        attempts: u32,
        context: &Value,
    ) -> Result<Escalation, VaultError> {
        let ts = timestamp();
        let name = format!("FAILURE_{}_{}.md", sanitize(action), ts);
        let context = serde_json::to_string_pretty(context)?;
        let body = format!(
            "# FAILURE REPORT: {action}\n\n\
             **Timestamp:** {now}\n\
             **Function:** {action}\n\
             **Attempts:** {attempts}\n\
             **Error:** {message}\n\n\
             ## Context\n\n```json\n{context}\n```\n\n\
             ## Recommended Action\n\n\
             Review the error above, resolve the root cause and re-run the action manually.\n",
            now = chrono::Local::now().to_rfc3339(),
        );
        let path = self
            .vault
            .write_new(&Location::of(VaultState::Alerts), &name, &body)?;
        self.enqueue(&ts, action, message, &file_name(&path)?)?;
        info!(report = %path.display(), "failure report written");
        Ok(Escalation::FailureReport(path))
    }

    /// Write `CRITICAL_ALERT_{ts}.md` for a failure that needs a human now
    pub fn critical_alert(&self, action: &str, message: &str) -> Result<Escalation, VaultError> {
        let name = format!("CRITICAL_ALERT_{}.md", timestamp_micros());
        let body = format!(
            "# CRITICAL ALERT: authentication failure\n\n\
             **Timestamp:** {now}\n\
             **Action:** {action}\n\
             **Error:** {message}\n\n\
             Automatic retries are suspended for this action. Refresh the \
             credentials or permissions, then re-submit the request.\n",
            now = chrono::Local::now().to_rfc3339(),
        );
        let path = self
            .vault
            .write_new(&Location::of(VaultState::Alerts), &name, &body)?;
        error!(alert = %path.display(), action, "critical alert raised");
        Ok(Escalation::CriticalAlert(path))
    }

    fn enqueue(&self, ts: &str, action: &str, message: &str, report: &str) -> Result<(), VaultError> {
        let path = self.queue_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VaultError::io(&path, e))?;
        let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
        let mut text = String::new();
        if fresh {
            text.push_str(QUEUE_HEADER);
        }
        text.push_str(&format!(
            "| {} | {} | {} | Pending Review | [{}](./{}) |\n",
            ts,
            cell(action),
            cell(message),
            report,
            report
        ));
        file.write_all(text.as_bytes())
            .map_err(|e| VaultError::io(&path, e))
    }

    pub fn queue_path(&self) -> PathBuf {
        self.vault.dir(VaultState::Alerts).join(FAILED_QUEUE)
    }

    /// Move an unprocessable file into Quarantine with a `.report` sidecar.
    /// Returns `None` if the file was already gone.
    pub fn quarantine(&self, path: &Path, reason: &str) -> Result<Option<PathBuf>, VaultError> {
        let original = path.display().to_string();
        let dest = match self
            .vault
            .transition(path, &Location::of(VaultState::Quarantine))?
        {
            MoveOutcome::Moved(dest) => dest,
            MoveOutcome::SourceMissing => return Ok(None),
        };
        let name = file_name(&dest)?;
        let report = format!(
            "Quarantined on: {}\nReason: {}\nOriginal Path: {}\n",
            chrono::Local::now().to_rfc3339(),
            reason,
            original
        );
        let report_path = self.vault.write_new(
            &Location::of(VaultState::Quarantine),
            &format!("{}.report", name),
            &report,
        )?;
        warn!(file = %name, reason, "quarantined");
        self.audit.log_best_effort(
            "quarantine_file",
            &name,
            json!({
                "reason": reason,
                "original_path": original,
                "report": report_path.display().to_string(),
            }),
            AuditResult::Failure,
        );
        Ok(Some(dest))
    }
}

fn sanitize(action: &str) -> String {
    action
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Keep a value on one markdown table row
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}
