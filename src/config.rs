use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::claim::ClaimMode;
use crate::error::ConfigError;

/// Runtime configuration, passed to every component at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Simulate side-effecting actions instead of performing them
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,

    /// tracing max level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root of the shared directory tree
    #[serde(default = "default_vault_root")]
    pub root: PathBuf,
    /// Name of this agent's In_Progress subdirectory
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub claim_mode: ClaimMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Actor recorded when a caller does not name one
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

/// One roster entry for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_restart")]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_reasoning_interval")]
    pub reasoning_interval_secs: u64,
    #[serde(default = "default_approval_interval")]
    pub approval_interval_secs: u64,
    #[serde(default = "default_intake_interval")]
    pub intake_interval_secs: u64,
    /// An Inbox file must be unmodified this long before it is picked up
    #[serde(default = "default_inbox_settle")]
    pub inbox_settle_ms: u64,
    /// Pause after an unhandled cycle error before the loop resumes
    #[serde(default = "default_cooldown")]
    pub error_cooldown_secs: u64,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Hour (local time) of the daily log rotation
    #[serde(default = "default_rotation_hour")]
    pub rotation_hour: u32,
    /// Local hour on Monday when the weekly summary runs
    #[serde(default = "default_summary_hour")]
    pub weekly_summary_hour: u32,
}

/// How approved actions are delivered when not in dry run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-invocation limit for an action command
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
    /// Action name to command line; the JSON payload is written to stdin
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

fn default_dry_run() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_vault_root() -> PathBuf {
    PathBuf::from("AI_Employee_Vault")
}

fn default_agent_id() -> String {
    "Agent_Local".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_retention_days() -> i64 {
    90
}

fn default_actor() -> String {
    "AI_Employee_01".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_restart() -> bool {
    true
}

fn default_reasoning_interval() -> u64 {
    10
}

fn default_approval_interval() -> u64 {
    10
}

fn default_intake_interval() -> u64 {
    5
}

fn default_inbox_settle() -> u64 {
    600
}

fn default_cooldown() -> u64 {
    10
}

fn default_approval_timeout() -> u64 {
    3600
}

fn default_rotation_hour() -> u32 {
    0
}

fn default_summary_hour() -> u32 {
    8
}

fn default_action_timeout() -> u64 {
    120
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_action_timeout(),
            commands: BTreeMap::new(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
            agent_id: default_agent_id(),
            claim_mode: ClaimMode::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            actor: default_actor(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            processes: Vec::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reasoning_interval_secs: default_reasoning_interval(),
            approval_interval_secs: default_approval_interval(),
            intake_interval_secs: default_intake_interval(),
            inbox_settle_ms: default_inbox_settle(),
            error_cooldown_secs: default_cooldown(),
            approval_timeout_secs: default_approval_timeout(),
            rotation_hour: default_rotation_hour(),
            weekly_summary_hour: default_summary_hour(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
            log_level: default_log_level(),
            vault: VaultConfig::default(),
            retry: RetryConfig::default(),
            audit: AuditConfig::default(),
            supervisor: SupervisorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!(vault = %config.vault.root.display(), agent_id = %config.vault.agent_id, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at the given vault
    pub fn for_vault(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.vault.root = root.into();
        config
    }

    /// Apply DRY_RUN, LOG_LEVEL, AGENT_NAME and VAULT_PATH from the environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DRY_RUN") {
            self.dry_run = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v.to_ascii_lowercase();
        }
        if let Some(v) = lookup("AGENT_NAME").filter(|v| !v.trim().is_empty()) {
            self.vault.agent_id = v;
        }
        if let Some(v) = lookup("VAULT_PATH").filter(|v| !v.trim().is_empty()) {
            self.vault.root = PathBuf::from(v);
        }
    }

    /// Check invariants. Run again after overrides, which bypass TOML loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault.agent_id.is_empty()
            || self.vault.agent_id.contains(['/', '\\'])
            || self.vault.agent_id.starts_with('.')
        {
            return Err(ConfigError::Invalid(format!(
                "agent_id {:?} must be a plain directory name",
                self.vault.agent_id
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.base_delay_secs < 0.0 || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "retry delays must be non-negative and backoff_factor >= 1".into(),
            ));
        }
        if self.audit.retention_days < 1 {
            return Err(ConfigError::Invalid("audit.retention_days must be >= 1".into()));
        }
        for p in &self.supervisor.processes {
            if p.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "process {} has an empty command",
                    p.name
                )));
            }
        }
        for (action, command) in &self.executor.commands {
            if command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "executor command for {} is empty",
                    action
                )));
            }
        }
        Ok(())
    }
}
