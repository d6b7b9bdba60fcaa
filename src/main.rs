use chrono::Local;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use vaultclaw::approval::{wait_for_decision, Decision};
use vaultclaw::audit::{AuditLogger, AuditResult};
use vaultclaw::briefing::{ceo_briefing, weekly_summary};
use vaultclaw::config::Config;
use vaultclaw::lock::InstanceLock;
use vaultclaw::orchestrator::Orchestrator;
use vaultclaw::supervisor::Supervisor;
use vaultclaw::vault::Vault;

const SUPERVISOR_LOCK: &str = ".supervisor.lock";

/// VaultClaw - file-coordinated business automation with human approval
#[derive(Parser, Debug)]
#[command(name = "vaultclaw", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vault root (overrides config and VAULT_PATH)
    #[arg(long)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the vault directory layout
    Init,
    /// Run intake, reasoning and approval execution
    Orchestrate {
        /// Run each stage once and exit
        #[arg(long)]
        once: bool,
    },
    /// Keep the configured processes running
    Supervise,
    /// Archive old audit logs and apply retention
    RotateLogs,
    /// Check an audit log for malformed lines (defaults to today's)
    ValidateLog { path: Option<PathBuf> },
    /// Write the weekly audit summary now
    Summary,
    /// Write the Monday CEO briefing now
    Briefing,
    /// Block until an approval request is approved, rejected or times out
    WaitApproval {
        name: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    if let Some(root) = &args.vault {
        config.vault.root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Flip the returned channel to true on ctrl-c or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    info!(
        vault = %config.vault.root.display(),
        agent = %config.vault.agent_id,
        dry_run = config.dry_run,
        "vaultclaw starting"
    );

    let vault = Vault::new(&config.vault.root);
    let audit = AuditLogger::new(&vault, config.audit.actor.clone());

    match args.command {
        Cmd::Init => {
            vault.ensure_layout(&[config.vault.agent_id.as_str()])?;
        }
        Cmd::Orchestrate { once } => {
            let mut orchestrator = Orchestrator::new(config)?;
            if once {
                let summary = orchestrator.run_once().await?;
                info!(
                    accepted = summary.intake.accepted,
                    claimed = summary.reasoning.claimed,
                    plans = summary.reasoning.plans.len(),
                    approvals = summary.reasoning.approvals.len(),
                    executed = summary.execution.executed,
                    failed = summary.execution.failed,
                    "cycle complete"
                );
            } else {
                orchestrator.run(shutdown_signal()).await;
            }
        }
        Cmd::Supervise => {
            vault.ensure_layout(&[])?;
            let _lock = InstanceLock::acquire(vault.root().join(SUPERVISOR_LOCK))?;
            let mut supervisor = Supervisor::new(&config.supervisor, audit.clone());
            audit.log_best_effort("system_start", "supervisor", json!({}), AuditResult::Success);
            supervisor.run(shutdown_signal()).await;
            audit.log_best_effort("system_stop", "supervisor", json!({}), AuditResult::Success);
        }
        Cmd::RotateLogs => {
            let report = audit.rotate(Local::now().date_naive(), config.audit.retention_days)?;
            audit.log_system(
                "rotate_logs",
                "Logs",
                json!({
                    "archived": report.archived,
                    "deleted": report.deleted,
                    "retention_days": config.audit.retention_days,
                }),
                AuditResult::Success,
            )?;
            info!(archived = report.archived.len(), deleted = report.deleted.len(), "rotation complete");
        }
        Cmd::ValidateLog { path } => {
            let path = path.unwrap_or_else(|| audit.today_path());
            let report = AuditLogger::validate(&path)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                error!(path = %path.display(), "audit log has invalid lines");
                return Err(format!("{} failed validation", path.display()).into());
            }
        }
        Cmd::Summary => {
            let (path, summary) = weekly_summary(&vault, &audit, Local::now().date_naive())?;
            info!(path = %path.display(), total = summary.total_actions, "summary written");
        }
        Cmd::Briefing => {
            let (path, briefing) = ceo_briefing(&vault, &audit, Local::now().date_naive())?;
            info!(
                path = %path.display(),
                revenue = briefing.revenue,
                expenses = briefing.expenses,
                "briefing written"
            );
        }
        Cmd::WaitApproval { name, timeout_secs } => {
            let timeout = Duration::from_secs(
                timeout_secs.unwrap_or(config.orchestrator.approval_timeout_secs),
            );
            match wait_for_decision(&vault, &name, timeout, Duration::from_secs(2)).await? {
                Decision::Approved => println!("approved"),
                Decision::Rejected => {
                    println!("rejected");
                    std::process::exit(2);
                }
            }
        }
    }

    Ok(())
}
