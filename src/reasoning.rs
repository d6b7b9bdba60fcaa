//! Reasoning cycle: Needs_Action tasks in, plans and approval requests out.
//!
//! One cycle claims every unclaimed task, classifies it, groups related tasks
//! into plans and writes one approval request per externally visible step.
//! Consumed tasks and the finished plan file end up in Done.
//!
//! Ordering matters for crash safety. The fingerprint is recorded only after
//! the approvals exist, so a crash in between replays the task (a duplicate
//! approval at worst) instead of losing it. Files left in this agent's
//! `In_Progress/` directory by a crash are resumed on the next cycle.

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::{ErrorManager, Escalation};
use crate::approval::ApprovalRequest;
use crate::audit::{AuditLogger, AuditResult};
use crate::claim::ClaimManager;
use crate::classifier::Classifier;
use crate::error::VaultError;
use crate::ledger::{fingerprint, DedupeLedger};
use crate::planner::{build_plans, Plan, SourceTask};
use crate::vault::{file_name, timestamp, Location, MoveOutcome, Vault, VaultState};

/// Counters for one reasoning cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningReport {
    pub claimed: usize,
    pub duplicates: usize,
    pub quarantined: usize,
    pub deferred: usize,
    pub plans: Vec<PathBuf>,
    pub approvals: Vec<PathBuf>,
}

/// A claimed task ready for planning
struct Claimed {
    path: PathBuf,
    fingerprint: String,
}

pub struct ReasoningEngine {
    vault: Vault,
    claims: ClaimManager,
    ledger: DedupeLedger,
    classifier: Arc<dyn Classifier>,
    errors: ErrorManager,
    audit: AuditLogger,
}

impl ReasoningEngine {
    pub fn new(
        vault: Vault,
        claims: ClaimManager,
        ledger: DedupeLedger,
        classifier: Arc<dyn Classifier>,
        errors: ErrorManager,
        audit: AuditLogger,
    ) -> Self {
        Self {
            vault,
            claims,
            ledger,
            classifier,
            errors,
            audit,
        }
    }

    pub async fn run_cycle(&mut self) -> Result<ReasoningReport, VaultError> {
        let mut report = ReasoningReport::default();

        let mut work = self.claims.held()?;
        if !work.is_empty() {
            info!(count = work.len(), "resuming tasks held from an earlier run");
        }
        for path in self.vault.list(&Location::of(VaultState::NeedsAction))? {
            let name = file_name(&path)?;
            if self.claims.is_claimed(&name)? {
                debug!(file = %name, "skipping, claimed elsewhere");
                continue;
            }
            if let Some(claimed) = self.claims.claim(&path)? {
                report.claimed += 1;
                work.push(claimed);
            }
        }

        let mut sources = Vec::new();
        let mut by_name: HashMap<String, Claimed> = HashMap::new();
        for path in work {
            if let Some((task, claimed)) = self.prepare(&path, &mut report).await? {
                by_name.insert(task.name.clone(), claimed);
                sources.push(task);
            }
        }
        if sources.is_empty() {
            return Ok(report);
        }

        for plan in build_plans(sources) {
            let members: Vec<Claimed> = plan
                .sources
                .iter()
                .filter_map(|s| by_name.remove(&s.name))
                .collect();
            self.emit(&plan, &mut report)?;
            for claimed in members {
                self.finish(&claimed)?;
            }
        }

        info!(
            plans = report.plans.len(),
            approvals = report.approvals.len(),
            duplicates = report.duplicates,
            "reasoning cycle complete"
        );
        Ok(report)
    }

    /// Read, dedupe and classify one claimed file
    async fn prepare(
        &mut self,
        path: &Path,
        report: &mut ReasoningReport,
    ) -> Result<Option<(SourceTask, Claimed)>, VaultError> {
        let name = file_name(path)?;
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::io(path, e)),
        };

        let text = match String::from_utf8(bytes.clone()) {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => {
                self.quarantine(path, &name, "empty task file", report)?;
                return Ok(None);
            }
            Err(_) => {
                self.quarantine(path, &name, "task file is not valid UTF-8", report)?;
                return Ok(None);
            }
        };

        let fp = fingerprint(&bytes, path);
        if self.ledger.seen(&fp) {
            info!(file = %name, "already processed, skipping");
            report.duplicates += 1;
            self.vault.transition(path, &Location::of(VaultState::Done))?;
            self.claims.release(&name);
            self.audit.log_best_effort(
                "skip_duplicate",
                &name,
                json!({"fingerprint": fp}),
                AuditResult::Success,
            );
            return Ok(None);
        }

        let classifier = Arc::clone(&self.classifier);
        let classified = self
            .errors
            .run("classify_task", &json!({"file": name}), || classifier.classify(&text))
            .await;
        let classification = match classified {
            Ok(c) => c,
            Err(failure) if failure.escalation == Escalation::Quarantine => {
                self.quarantine(path, &name, &failure.error.to_string(), report)?;
                return Ok(None);
            }
            Err(failure) => {
                // Stays in our In_Progress directory and is resumed next cycle
                warn!(file = %name, error = %failure, "classification failed, deferring");
                report.deferred += 1;
                return Ok(None);
            }
        };
        debug!(
            file = %name,
            intent = %classification.intent,
            confidence = classification.confidence,
            "classified"
        );

        Ok(Some((
            SourceTask::new(name, &text, classification),
            Claimed {
                path: path.to_path_buf(),
                fingerprint: fp,
            },
        )))
    }

    /// Write the plan and its approval requests, then retire the plan file
    fn emit(&self, plan: &Plan, report: &mut ReasoningReport) -> Result<(), VaultError> {
        let plan_path = self.vault.write_new(
            &Location::of(VaultState::Plans),
            &plan.file_name(&timestamp()),
            &plan.render(),
        )?;
        let plan_name = file_name(&plan_path)?;
        info!(plan = %plan_name, priority = %plan.priority, "plan written");

        let mut approvals = Vec::new();
        for step in plan.approval_steps() {
            let request = ApprovalRequest::new(&step.action, step.params.clone())
                .with_tool(&step.tool)
                .with_plan(&plan_name)
                .with_body(format!("## {}\n\n{}\n", step.action, step.detail));
            let path = self.vault.write_new(
                &Location::of(VaultState::PendingApproval),
                &request.file_name(),
                &request.render()?,
            )?;
            info!(approval = %path.display(), action = %step.action, "approval requested");
            approvals.push(file_name(&path)?);
            report.approvals.push(path);
        }

        self.audit.log_best_effort(
            "create_plan",
            &plan_name,
            json!({
                "intent": plan.intent,
                "priority": plan.priority.to_string(),
                "steps": plan.steps.len(),
                "approvals": approvals,
                "sources": plan.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            }),
            AuditResult::Success,
        );

        match self.vault.transition(&plan_path, &Location::of(VaultState::Done))? {
            MoveOutcome::Moved(done) => report.plans.push(done),
            MoveOutcome::SourceMissing => warn!(plan = %plan_name, "plan vanished before archiving"),
        }
        Ok(())
    }

    fn finish(&mut self, claimed: &Claimed) -> Result<(), VaultError> {
        let name = file_name(&claimed.path)?;
        self.ledger.record(&claimed.fingerprint)?;
        self.vault
            .transition(&claimed.path, &Location::of(VaultState::Done))?;
        self.claims.release(&name);
        Ok(())
    }

    fn quarantine(
        &self,
        path: &Path,
        name: &str,
        reason: &str,
        report: &mut ReasoningReport,
    ) -> Result<(), VaultError> {
        if self.errors.quarantine(path, reason)?.is_some() {
            report.quarantined += 1;
        } else {
            error!(file = %name, "could not quarantine, file already gone");
        }
        self.claims.release(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimMode;
    use crate::classifier::{Classification, KeywordClassifier};
    use crate::error::ActionError;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use tempfile::tempdir;

    fn engine_with(
        vault: &Vault,
        classifier: Arc<dyn Classifier>,
    ) -> ReasoningEngine {
        let audit = AuditLogger::new(vault, "tester");
        let claims = ClaimManager::new(vault.clone(), "agent_a", ClaimMode::Optimistic);
        let ledger = DedupeLedger::open(vault.root().join(".ledger")).unwrap();
        let errors = ErrorManager::new(vault.clone(), audit.clone(), RetryPolicy::once());
        ReasoningEngine::new(vault.clone(), claims, ledger, classifier, errors, audit)
    }

    fn setup() -> (tempfile::TempDir, Vault, ReasoningEngine) {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&["agent_a"]).unwrap();
        let engine = engine_with(&vault, Arc::new(KeywordClassifier::new().unwrap()));
        (dir, vault, engine)
    }

    fn needs_action(vault: &Vault, name: &str, text: &str) -> PathBuf {
        vault
            .write_new(&Location::of(VaultState::NeedsAction), name, text)
            .unwrap()
    }

    #[tokio::test]
    async fn test_cross_domain_cycle() {
        let (_dir, vault, mut engine) = setup();
        needs_action(&vault, "invoice.md", "$1500 invoice for Client A");
        needs_action(&vault, "fee.md", "$35 overdue late fee");

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.plans.len(), 1);
        assert_eq!(report.approvals.len(), 2);

        let plan = std::fs::read_to_string(&report.plans[0]).unwrap();
        assert!(plan.contains("intent: cross_domain_recovery"));
        assert_eq!(vault.list(&Location::of(VaultState::PendingApproval)).unwrap().len(), 2);
        assert_eq!(vault.find("invoice.md").unwrap(), vec![Location::of(VaultState::Done)]);
        assert_eq!(vault.find("fee.md").unwrap(), vec![Location::of(VaultState::Done)]);
        assert!(vault.list(&Location::claimed_by("agent_a")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_of_processed_file_is_skipped() {
        let (_dir, vault, mut engine) = setup();
        needs_action(&vault, "invoice.md", "Invoice for Client B");
        let first = engine.run_cycle().await.unwrap();
        assert_eq!(first.plans.len(), 1);
        let approvals = vault.list(&Location::of(VaultState::PendingApproval)).unwrap().len();

        // Same bytes under the same name show up again
        needs_action(&vault, "invoice.md", "Invoice for Client B");
        let second = engine.run_cycle().await.unwrap();
        assert_eq!(second.duplicates, 1);
        assert!(second.plans.is_empty());
        assert_eq!(
            vault.list(&Location::of(VaultState::PendingApproval)).unwrap().len(),
            approvals
        );
    }

    #[tokio::test]
    async fn test_unknown_goes_straight_to_done() {
        let (_dir, vault, mut engine) = setup();
        needs_action(&vault, "note.md", "just a note");
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.plans.len(), 1);
        assert!(report.approvals.is_empty());
        assert_eq!(vault.find("note.md").unwrap(), vec![Location::of(VaultState::Done)]);
    }

    #[tokio::test]
    async fn test_invalid_task_quarantined() {
        let (_dir, vault, mut engine) = setup();
        std::fs::write(vault.dir(VaultState::NeedsAction).join("bin.md"), [0xff, 0xfe, 0x00]).unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(vault.find("bin.md").unwrap(), vec![Location::of(VaultState::Quarantine)]);
    }

    #[tokio::test]
    async fn test_claimed_elsewhere_is_left_alone() {
        let (_dir, vault, mut engine) = setup();
        vault.ensure_layout(&["agent_b"]).unwrap();
        vault
            .write_new(&Location::claimed_by("agent_b"), "x.md", "invoice")
            .unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(vault.find("x.md").unwrap(), vec![Location::claimed_by("agent_b")]);
    }

    #[tokio::test]
    async fn test_held_files_resumed() {
        let (_dir, vault, mut engine) = setup();
        vault
            .write_new(&Location::claimed_by("agent_a"), "left.md", "Invoice for Client C")
            .unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.plans.len(), 1);
        assert_eq!(vault.find("left.md").unwrap(), vec![Location::of(VaultState::Done)]);
    }

    struct FlakyClassifier;

    #[async_trait]
    impl Classifier for FlakyClassifier {
        async fn classify(&self, _text: &str) -> Result<Classification, ActionError> {
            Err(ActionError::failed("model endpoint unreachable"))
        }
    }

    #[tokio::test]
    async fn test_classifier_outage_defers() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&["agent_a"]).unwrap();
        let mut engine = engine_with(&vault, Arc::new(FlakyClassifier));
        needs_action(&vault, "t.md", "invoice");

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(vault.find("t.md").unwrap(), vec![Location::claimed_by("agent_a")]);
    }
}
