use async_trait::async_trait;
use chrono::{Local, Weekday};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::alerts::ErrorManager;
use crate::audit::{AuditLogger, AuditResult};
use crate::briefing::{ceo_briefing, weekly_summary};
use crate::claim::ClaimManager;
use crate::classifier::{Classifier, KeywordClassifier};
use crate::config::Config;
use crate::error::{OrchestratorError, VaultError};
use crate::executor::{ActionExecutor, ApprovalExecutor, CommandExecutor, ExecutionReport};
use crate::ledger::DedupeLedger;
use crate::lock::InstanceLock;
use crate::metrics::Metrics;
use crate::reasoning::{ReasoningEngine, ReasoningReport};
use crate::retry::RetryPolicy;
use crate::scheduler::{Job, JobError, Schedule, Scheduler};
use crate::vault::Vault;
use crate::watcher::{InboxWatcher, IntakeReport};

/// Lock file at the vault root held while an agent's orchestrator runs.
/// Agents sharing a vault each hold their own.
pub fn lock_file(agent_id: &str) -> String {
    format!(".orchestrator.{}.lock", agent_id)
}

/// Fingerprints of tasks already planned
pub const LEDGER_FILE: &str = ".processed_ledger";

const HEARTBEAT: Duration = Duration::from_secs(60);
const TICK: Duration = Duration::from_secs(1);

/// Result of one pass over every stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub intake: IntakeReport,
    pub reasoning: ReasoningReport,
    pub execution: ExecutionReport,
}

pub struct Orchestrator {
    config: Config,
    vault: Vault,
    audit: AuditLogger,
    watcher: InboxWatcher,
    engine: ReasoningEngine,
    executor: ApprovalExecutor,
    errors: ErrorManager,
    metrics: Arc<Mutex<Metrics>>,
    lock: InstanceLock,
}

impl Orchestrator {
    /// Build with the keyword classifier and configured action commands
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        let classifier = Arc::new(KeywordClassifier::new()?);
        let executor = Arc::new(CommandExecutor::new(&config.executor));
        Self::with_collaborators(config, classifier, executor)
    }

    pub fn with_collaborators(
        config: Config,
        classifier: Arc<dyn Classifier>,
        actions: Arc<dyn ActionExecutor>,
    ) -> Result<Self, OrchestratorError> {
        let vault = Vault::new(&config.vault.root);
        let agent_id = config.vault.agent_id.clone();
        vault.ensure_layout(&[agent_id.as_str()])?;
        let lock = InstanceLock::acquire(vault.root().join(lock_file(&agent_id)))?;

        let audit = AuditLogger::new(&vault, config.audit.actor.clone());
        let errors = ErrorManager::new(
            vault.clone(),
            audit.clone(),
            RetryPolicy::from_config(&config.retry),
        );
        let ledger = DedupeLedger::open(vault.root().join(LEDGER_FILE))?;
        let claims = ClaimManager::new(vault.clone(), agent_id, config.vault.claim_mode);

        let watcher = InboxWatcher::new(
            vault.clone(),
            audit.clone(),
            errors.clone(),
            Duration::from_millis(config.orchestrator.inbox_settle_ms),
        );
        let engine = ReasoningEngine::new(
            vault.clone(),
            claims.clone(),
            ledger,
            classifier,
            errors.clone(),
            audit.clone(),
        );
        let executor = ApprovalExecutor::new(
            vault.clone(),
            audit.clone(),
            errors.clone(),
            actions,
            config.dry_run,
        )
        .with_claims(claims);

        info!(
            vault = %vault.root().display(),
            agent = %config.vault.agent_id,
            dry_run = config.dry_run,
            "orchestrator ready"
        );

        Ok(Self {
            config,
            vault,
            audit,
            watcher,
            engine,
            executor,
            errors,
            metrics: Arc::new(Mutex::new(Metrics::new())),
            lock,
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub async fn metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Intake, reasoning and execution once each, in pipeline order
    pub async fn run_once(&mut self) -> Result<CycleSummary, VaultError> {
        let intake = self.watcher.run_cycle()?;
        let reasoning = self.engine.run_cycle().await?;
        let execution = self.executor.run_cycle().await?;
        Ok(CycleSummary {
            intake,
            reasoning,
            execution,
        })
    }

    /// Run every cycle on its schedule until `shutdown` turns true
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let audit = self.audit.clone();
        audit.log_best_effort(
            "system_start",
            "orchestrator",
            json!({"dry_run": self.config.dry_run, "agent": self.config.vault.agent_id}),
            AuditResult::Success,
        );

        let mut scheduler = self.into_scheduler();
        scheduler.run(shutdown).await;

        audit.log_best_effort("system_stop", "orchestrator", json!({}), AuditResult::Success);
    }

    /// Hand every stage to a scheduler. The instance lock moves with the
    /// heartbeat job and is released when the scheduler is dropped.
    pub fn into_scheduler(self) -> Scheduler {
        let o = &self.config.orchestrator;
        let mut scheduler = Scheduler::new(TICK, Duration::from_secs(o.error_cooldown_secs));
        let metrics = self.metrics;
        let tracker = Tracker {
            metrics: Arc::clone(&metrics),
            errors: self.errors,
            audit: self.audit.clone(),
        };

        scheduler.add(
            tracker.wrap(IntakeJob { watcher: self.watcher }),
            Schedule::Every(Duration::from_secs(o.intake_interval_secs)),
        );
        scheduler.add(
            tracker.wrap(ReasoningJob { engine: self.engine }),
            Schedule::Every(Duration::from_secs(o.reasoning_interval_secs)),
        );
        scheduler.add(
            tracker.wrap(ApprovalJob { executor: self.executor }),
            Schedule::Every(Duration::from_secs(o.approval_interval_secs)),
        );
        scheduler.add(
            tracker.wrap(RotationJob {
                audit: self.audit.clone(),
                retention_days: self.config.audit.retention_days,
            }),
            Schedule::Daily {
                hour: o.rotation_hour,
            },
        );
        scheduler.add(
            tracker.wrap(SummaryJob {
                vault: self.vault,
                audit: self.audit,
            }),
            Schedule::Weekly {
                weekday: Weekday::Mon,
                hour: o.weekly_summary_hour,
            },
        );
        scheduler.add(
            Box::new(HeartbeatJob {
                metrics,
                _lock: self.lock,
            }),
            Schedule::Every(HEARTBEAT),
        );
        scheduler
    }
}

/// Shared sinks for every scheduled job's outcome
#[derive(Clone)]
struct Tracker {
    metrics: Arc<Mutex<Metrics>>,
    errors: ErrorManager,
    audit: AuditLogger,
}

impl Tracker {
    fn wrap<J: Job + 'static>(&self, inner: J) -> Box<dyn Job> {
        Box::new(Tracked {
            inner,
            tracker: self.clone(),
        })
    }
}

/// Counts runs of the wrapped job. A failed run also leaves a failure report
/// in Alerts and a failure entry in the audit log.
struct Tracked<J> {
    inner: J,
    tracker: Tracker,
}

#[async_trait]
impl<J: Job> Job for Tracked<J> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let result = self.inner.run().await;
        let name = self.inner.name();
        match &result {
            Ok(()) => self.tracker.metrics.lock().await.record_success(name),
            Err(e) => {
                let message = e.to_string();
                self.tracker
                    .metrics
                    .lock()
                    .await
                    .record_failure(name, message.clone());
                if let Err(report_err) =
                    self.tracker
                        .errors
                        .failure_report(name, &message, 1, &json!({"job": name}))
                {
                    error!(job = %name, error = %report_err, "failed to write failure report");
                }
                self.tracker.audit.log_best_effort(
                    "job_failure",
                    name,
                    json!({"error": message}),
                    AuditResult::Failure,
                );
            }
        }
        result
    }
}

struct IntakeJob {
    watcher: InboxWatcher,
}

#[async_trait]
impl Job for IntakeJob {
    fn name(&self) -> &str {
        "intake"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let report = self.watcher.run_cycle()?;
        if report.accepted + report.quarantined > 0 {
            info!(accepted = report.accepted, quarantined = report.quarantined, "intake cycle");
        }
        Ok(())
    }
}

struct ReasoningJob {
    engine: ReasoningEngine,
}

#[async_trait]
impl Job for ReasoningJob {
    fn name(&self) -> &str {
        "reasoning"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let report = self.engine.run_cycle().await?;
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                plans = report.plans.len(),
                approvals = report.approvals.len(),
                "reasoning cycle"
            );
        }
        Ok(())
    }
}

struct ApprovalJob {
    executor: ApprovalExecutor,
}

#[async_trait]
impl Job for ApprovalJob {
    fn name(&self) -> &str {
        "approvals"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let report = self.executor.run_cycle().await?;
        if report.executed + report.failed + report.quarantined > 0 {
            info!(
                executed = report.executed,
                failed = report.failed,
                quarantined = report.quarantined,
                "approval cycle"
            );
        }
        Ok(())
    }
}

struct RotationJob {
    audit: AuditLogger,
    retention_days: i64,
}

#[async_trait]
impl Job for RotationJob {
    fn name(&self) -> &str {
        "log_rotation"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let report = self
            .audit
            .rotate(Local::now().date_naive(), self.retention_days)?;
        self.audit.log_system(
            "rotate_logs",
            "Logs",
            json!({
                "archived": report.archived,
                "deleted": report.deleted,
                "retention_days": self.retention_days,
            }),
            AuditResult::Success,
        )?;
        Ok(())
    }
}

struct SummaryJob {
    vault: Vault,
    audit: AuditLogger,
}

#[async_trait]
impl Job for SummaryJob {
    fn name(&self) -> &str {
        "weekly_summary"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let today = Local::now().date_naive();
        weekly_summary(&self.vault, &self.audit, today)?;
        ceo_briefing(&self.vault, &self.audit, today)?;
        Ok(())
    }
}

struct HeartbeatJob {
    metrics: Arc<Mutex<Metrics>>,
    _lock: InstanceLock,
}

#[async_trait]
impl Job for HeartbeatJob {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let mut metrics = self.metrics.lock().await;
        metrics.increment_uptime(HEARTBEAT.as_secs());
        metrics.update_memory();
        info!(
            uptime_sec = metrics.uptime_sec,
            cycles = metrics.cycles_total,
            failed = metrics.cycles_failed,
            success_rate = metrics.success_rate(),
            memory_bytes = metrics.memory_bytes,
            "heartbeat"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{Location, VaultState};
    use serde_json::Value;
    use std::fs;
    use tempfile::tempdir;

    struct Echo;

    #[async_trait]
    impl ActionExecutor for Echo {
        async fn execute(
            &self,
            _action: &str,
            payload: &Value,
        ) -> Result<Value, crate::error::ActionError> {
            Ok(payload.clone())
        }
    }

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::for_vault(root);
        config.orchestrator.inbox_settle_ms = 0;
        config
    }

    fn build(config: Config) -> Result<Orchestrator, OrchestratorError> {
        let classifier = Arc::new(KeywordClassifier::new().unwrap());
        Orchestrator::with_collaborators(config, classifier, Arc::new(Echo))
    }

    #[test]
    fn test_second_instance_is_locked_out() {
        let dir = tempdir().unwrap();
        let first = build(config(dir.path())).unwrap();
        let second = build(config(dir.path()));
        assert!(matches!(
            second,
            Err(OrchestratorError::Vault(VaultError::Locked(_)))
        ));
        drop(first);
        assert!(build(config(dir.path())).is_ok());
    }

    #[tokio::test]
    async fn test_run_once_moves_inbox_to_approval() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build(config(dir.path())).unwrap();
        let vault = orchestrator.vault().clone();
        fs::write(
            vault.dir(VaultState::Inbox).join("bill.md"),
            "Please invoice Client ACME $1,500.00 for consulting",
        )
        .unwrap();

        let summary = orchestrator.run_once().await.unwrap();
        assert_eq!(summary.intake.accepted, 1);
        assert_eq!(summary.reasoning.claimed, 1);
        assert_eq!(summary.reasoning.plans.len(), 1);
        assert!(!summary.reasoning.approvals.is_empty());
        assert_eq!(vault.find("bill.md").unwrap(), vec![Location::of(VaultState::Done)]);
        assert_eq!(
            vault.list(&Location::of(VaultState::PendingApproval)).unwrap().len(),
            summary.reasoning.approvals.len()
        );
    }

    struct Broken;

    #[async_trait]
    impl Job for Broken {
        fn name(&self) -> &str {
            "weekly_summary"
        }

        async fn run(&mut self) -> Result<(), JobError> {
            Err("Briefings is not writable".into())
        }
    }

    #[tokio::test]
    async fn test_failed_job_is_reported_and_audited() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&[]).unwrap();
        let audit = AuditLogger::new(&vault, "tester");
        let metrics = Arc::new(Mutex::new(Metrics::new()));
        let tracker = Tracker {
            metrics: Arc::clone(&metrics),
            errors: ErrorManager::new(vault.clone(), audit.clone(), RetryPolicy::default()),
            audit: audit.clone(),
        };

        let mut job = tracker.wrap(Broken);
        assert!(job.run().await.is_err());

        let reports: Vec<_> = vault
            .list(&Location::of(VaultState::Alerts))
            .unwrap()
            .into_iter()
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("FAILURE_"))
            .collect();
        assert_eq!(reports.len(), 1);
        let name = reports[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("FAILURE_weekly_summary_"));
        assert!(fs::read_to_string(&reports[0])
            .unwrap()
            .contains("Briefings is not writable"));

        let entries = AuditLogger::read_entries(&audit.today_path()).unwrap();
        let failures: Vec<_> = entries
            .iter()
            .filter(|e| e.action_type == "job_failure")
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target, "weekly_summary");
        assert_eq!(failures[0].result, AuditResult::Failure);

        let metrics = metrics.lock().await;
        assert_eq!(metrics.jobs["weekly_summary"].failures, 1);
        assert!((metrics.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_agents_lock_independently() {
        let dir = tempdir().unwrap();
        let mut cloud = config(dir.path());
        cloud.vault.agent_id = "Agent_Cloud".into();
        let _local = build(config(dir.path())).unwrap();
        let _cloud = build(cloud).unwrap();
        assert!(dir.path().join(lock_file("Agent_Local")).exists());
        assert!(dir.path().join(lock_file("Agent_Cloud")).exists());
    }

    #[tokio::test]
    async fn test_scheduler_runs_until_shutdown() {
        let dir = tempdir().unwrap();
        let orchestrator = build(config(dir.path())).unwrap();
        let vault = orchestrator.vault().clone();
        fs::write(
            vault.dir(VaultState::Inbox).join("meet.md"),
            "Can we schedule a meeting next week?",
        )
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(vault.find("meet.md").unwrap(), vec![Location::of(VaultState::Done)]);
        assert!(!vault.root().join(lock_file("Agent_Local")).exists());

        let audit = AuditLogger::new(&vault, "reader");
        let entries = AuditLogger::read_entries(&audit.today_path()).unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.action_type.as_str()).collect();
        assert_eq!(kinds.first(), Some(&"system_start"));
        assert_eq!(kinds.last(), Some(&"system_stop"));
    }
}
