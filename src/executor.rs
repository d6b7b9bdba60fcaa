//! Execution of approved actions.
//!
//! The executor scans `Approved/`, runs each request through the
//! [`ErrorManager`], writes exactly one audit entry for it and moves the file
//! to `Done/` whether the action succeeded or failed. Only structurally broken
//! requests leave the flow, into `Quarantine/`.

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::alerts::{ErrorManager, Escalation};
use crate::approval::ApprovalRequest;
use crate::audit::{AuditLogger, AuditResult};
use crate::claim::ClaimManager;
use crate::config::ExecutorConfig;
use crate::error::{ActionError, VaultError};
use crate::retry::{is_sensitive_action, ErrorClass};
use crate::vault::{file_name, Location, Vault, VaultState};

const LEDGER_HEADER: &str =
    "| Time | Action | Tool | Target | Amount | Mode |\n|---|---|---|---|---|---|\n";

/// Delivers one action to the outside world
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &str, params: &Value) -> Result<Value, ActionError>;
}

/// Runs a configured command per action with the JSON payload on stdin.
/// A zero exit status is success; stdout is returned, parsed as JSON when it is.
pub struct CommandExecutor {
    commands: BTreeMap<String, Vec<String>>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, action: &str, params: &Value) -> Result<Value, ActionError> {
        let argv = self
            .commands
            .get(action)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActionError::failed(format!("failed to spawn {}: {}", argv[0], e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(params)
                .map_err(|e| ActionError::Malformed(e.to_string()))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ActionError::failed(format!("writing payload: {}", e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ActionError::failed(format!("{} timed out after {:?}", action, self.timeout))
            })?
            .map_err(|e| ActionError::failed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActionError::failed(format!(
                "{} exited with {}: {}",
                action,
                output.status,
                stderr.trim()
            )));
        }
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

/// Counters for one execution cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
    pub failed: usize,
    pub quarantined: usize,
    /// Failures that raised a CRITICAL alert
    pub critical: usize,
}

pub struct ApprovalExecutor {
    vault: Vault,
    audit: AuditLogger,
    errors: ErrorManager,
    executor: Arc<dyn ActionExecutor>,
    dry_run: bool,
    claims: Option<ClaimManager>,
}

impl ApprovalExecutor {
    pub fn new(
        vault: Vault,
        audit: AuditLogger,
        errors: ErrorManager,
        executor: Arc<dyn ActionExecutor>,
        dry_run: bool,
    ) -> Self {
        Self {
            vault,
            audit,
            errors,
            executor,
            dry_run,
            claims: None,
        }
    }

    /// Execute only the requests this agent holds a claim marker for, so
    /// agents sharing a vault never run the same approval twice.
    pub fn with_claims(mut self, claims: ClaimManager) -> Self {
        self.claims = Some(claims);
        self
    }

    pub async fn run_cycle(&self) -> Result<ExecutionReport, VaultError> {
        let mut report = ExecutionReport::default();
        for path in self.vault.list(&Location::of(VaultState::Approved))? {
            let Some(claims) = &self.claims else {
                self.process(&path, &mut report).await?;
                continue;
            };
            let name = file_name(&path)?;
            if !claims.claim_approval(&name)? {
                debug!(file = %name, "skipping approval claimed elsewhere");
                continue;
            }
            let result = self.process(&path, &mut report).await;
            claims.release_approval(&name);
            result?;
        }
        if report != ExecutionReport::default() {
            info!(
                executed = report.executed,
                failed = report.failed,
                quarantined = report.quarantined,
                "approval cycle complete"
            );
        }
        if report.critical > 0 {
            error!(count = report.critical, "actions blocked on credentials, see Alerts");
        }
        Ok(report)
    }

    async fn process(&self, path: &Path, report: &mut ExecutionReport) -> Result<(), VaultError> {
        let name = file_name(path)?;
        let text = match fs::read(path) {
            Ok(bytes) => String::from_utf8(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VaultError::io(path, e)),
        };
        let request = match text
            .map_err(|_| "approval file is not valid UTF-8".to_string())
            .and_then(|t| ApprovalRequest::parse(&name, &t).map_err(|e| e.to_string()))
        {
            Ok(r) => r,
            Err(reason) => {
                if self.errors.quarantine(path, &reason)?.is_some() {
                    report.quarantined += 1;
                }
                return Ok(());
            }
        };

        let action = request.action.clone();
        let sensitive = is_sensitive_action(&action)
            || request.tool.as_deref().is_some_and(is_sensitive_action);
        let mut parameters = match &request.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        parameters.insert("dry_run".into(), json!(self.dry_run));
        if let Some(tool) = &request.tool {
            parameters.insert("tool".into(), json!(tool));
        }

        let outcome = if self.dry_run {
            info!(file = %name, action = %action, "[DRY RUN] would execute");
            Ok(json!({"dry_run": true}))
        } else {
            let executor = Arc::clone(&self.executor);
            let params = &request.params;
            self.errors
                .run_as(&action, sensitive, &request.params, || {
                    executor.execute(&action, params)
                })
                .await
        };

        let result = match outcome {
            Ok(response) => {
                info!(file = %name, action = %action, "action executed");
                if !response.is_null() && !self.dry_run {
                    parameters.insert("response".into(), response);
                }
                if sensitive || request.tool.as_deref().is_some_and(|t| t.starts_with("odoo.")) {
                    if let Err(e) = self.record_accounting(&request) {
                        error!(file = %name, error = %e, "failed to update accounting ledger");
                    }
                }
                report.executed += 1;
                AuditResult::Success
            }
            Err(failure) if failure.escalation == Escalation::Quarantine => {
                if self
                    .errors
                    .quarantine(path, &failure.error.to_string())?
                    .is_some()
                {
                    report.quarantined += 1;
                }
                return Ok(());
            }
            Err(failure) => {
                warn!(file = %name, error = %failure, "action failed");
                parameters.insert("error".into(), json!(failure.error.to_string()));
                parameters.insert("attempts".into(), json!(failure.attempts));
                if failure.class == ErrorClass::Auth {
                    report.critical += 1;
                }
                report.failed += 1;
                AuditResult::Failure
            }
        };

        if let Err(e) = self.audit.log(
            &action,
            &request.target(),
            Value::Object(parameters),
            result,
            "approved",
            "human",
        ) {
            error!(file = %name, error = %e, "failed to write audit entry");
        }
        self.vault
            .transition(path, &Location::of(VaultState::Done))?;
        Ok(())
    }

    /// Append a row to `Accounting/{date}_Ledger.md`
    fn record_accounting(&self, request: &ApprovalRequest) -> Result<PathBuf, VaultError> {
        let now = Local::now();
        let dir = self.vault.accounting_dir();
        fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
        let path = dir.join(format!("{}_Ledger.md", now.format("%Y-%m-%d")));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VaultError::io(&path, e))?;
        let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(false);

        let mut text = String::new();
        if fresh {
            text.push_str(&format!("# Accounting Ledger {}\n\n", now.format("%Y-%m-%d")));
            text.push_str(LEDGER_HEADER);
        }
        let amount = match request.params.get("amount") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => "-".to_string(),
        };
        text.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            now.format("%H:%M:%S"),
            request.action,
            request.tool.as_deref().unwrap_or("-"),
            request.target(),
            amount,
            if self.dry_run { "dry-run" } else { "live" }
        ));
        file.write_all(text.as_bytes())
            .map_err(|e| VaultError::io(&path, e))?;
        Ok(path)
    }
}
