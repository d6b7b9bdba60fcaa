//! Append-only structured audit journal.
//!
//! One file per local day, `Logs/{YYYY-MM-DD}_audit.jsonl`, one JSON object per
//! line. Lines are only ever appended; rotation moves whole files into
//! `Logs/Archive/` and deletes archived days past the retention window.
//!
//! ```jsonl
//! {"timestamp":"2024-05-06T09:00:00.000000+02:00","action_type":"send_email","actor":"AI_Employee_01","target":"a@b.c","parameters":{},"approval_status":"approved","approved_by":"human","result":"success"}
//! ```

use chrono::{Local, NaiveDate, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::VaultError;
use crate::vault::{list_files, Vault, VaultState};

/// Keys every audit line must carry
pub const REQUIRED_FIELDS: [&str; 8] = [
    "timestamp",
    "action_type",
    "actor",
    "target",
    "parameters",
    "approval_status",
    "approved_by",
    "result",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub action_type: String,
    pub actor: String,
    pub target: String,
    pub parameters: Value,
    pub approval_status: String,
    pub approved_by: String,
    pub result: AuditResult,
}

/// Outcome of scanning one log file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_entries: usize,
    /// Lines that are not valid JSON objects
    pub malformed: usize,
    /// Valid JSON missing one or more required keys
    pub invalid_schema: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.malformed == 0 && self.invalid_schema == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub archived: Vec<String>,
    pub deleted: Vec<String>,
}

/// Writer/reader for the daily audit journal
#[derive(Debug, Clone)]
pub struct AuditLogger {
    logs_dir: PathBuf,
    archive_dir: PathBuf,
    actor: String,
}

impl AuditLogger {
    pub fn new(vault: &Vault, actor: impl Into<String>) -> Self {
        Self {
            logs_dir: vault.dir(VaultState::Logs),
            archive_dir: vault.dir(VaultState::Archive),
            actor: actor.into(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// File name for a given day
    pub fn file_name_for(date: NaiveDate) -> String {
        format!("{}_audit.jsonl", date.format("%Y-%m-%d"))
    }

    pub fn today_path(&self) -> PathBuf {
        self.logs_dir
            .join(Self::file_name_for(Local::now().date_naive()))
    }

    /// Append one entry as the default actor
    pub fn log(
        &self,
        action_type: &str,
        target: &str,
        parameters: Value,
        result: AuditResult,
        approval_status: &str,
        approved_by: &str,
    ) -> Result<AuditEntry, VaultError> {
        let entry = AuditEntry {
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            action_type: action_type.to_string(),
            actor: self.actor.clone(),
            target: target.to_string(),
            parameters,
            approval_status: approval_status.to_string(),
            approved_by: approved_by.to_string(),
            result,
        };
        self.append(&entry)?;
        Ok(entry)
    }

    /// Append a system event that needed no approval
    pub fn log_system(
        &self,
        action_type: &str,
        target: &str,
        parameters: Value,
        result: AuditResult,
    ) -> Result<AuditEntry, VaultError> {
        self.log(action_type, target, parameters, result, "n/a", "n/a")
    }

    /// Like [`log_system`](Self::log_system), but a journal write failure is
    /// only reported through tracing. Used on paths that are already handling
    /// another error.
    pub fn log_best_effort(
        &self,
        action_type: &str,
        target: &str,
        parameters: Value,
        result: AuditResult,
    ) {
        if let Err(e) = self.log_system(action_type, target, parameters, result) {
            error!(action_type, target, error = %e, "failed to write audit entry");
        }
    }

    /// Append a prepared entry to today's file.
    ///
    /// The whole line goes out in one `write_all` on an `O_APPEND` handle so
    /// concurrent writers from other processes never interleave mid-line.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), VaultError> {
        fs::create_dir_all(&self.logs_dir).map_err(|e| VaultError::io(&self.logs_dir, e))?;
        let path = self.today_path();
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VaultError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| VaultError::io(&path, e))?;
        Ok(())
    }

    /// Load every well-formed entry of a log file, skipping bad lines
    pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, VaultError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(path, e)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| VaultError::io(path, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable audit line"),
            }
        }
        Ok(entries)
    }

    /// Entries recorded on a given day, looking in Archive first
    pub fn entries_for(&self, date: NaiveDate) -> Result<Vec<AuditEntry>, VaultError> {
        let name = Self::file_name_for(date);
        let archived = self.archive_dir.join(&name);
        if archived.exists() {
            return Self::read_entries(&archived);
        }
        Self::read_entries(&self.logs_dir.join(name))
    }

    /// Integrity check over one log file
    pub fn validate(path: &Path) -> Result<ValidationReport, VaultError> {
        let file = File::open(path).map_err(|e| VaultError::io(path, e))?;
        let mut report = ValidationReport::default();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| VaultError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            report.total_entries += 1;
            match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(map)) => {
                    if !REQUIRED_FIELDS.iter().all(|k| map.contains_key(*k)) {
                        report.invalid_schema += 1;
                    }
                }
                _ => report.malformed += 1,
            }
        }
        Ok(report)
    }

    /// Archive every daily log older than `today`, then delete archived days
    /// strictly older than `today - retention_days`.
    pub fn rotate(&self, today: NaiveDate, retention_days: i64) -> Result<RotationReport, VaultError> {
        fs::create_dir_all(&self.archive_dir).map_err(|e| VaultError::io(&self.archive_dir, e))?;
        let mut report = RotationReport::default();

        for path in list_files(&self.logs_dir, |n| n.ends_with("_audit.jsonl"))? {
            let Some(date) = log_date(&path) else { continue };
            if date >= today {
                continue;
            }
            let name = file_name_of(&path);
            let dest = self.archive_dir.join(&name);
            if dest.exists() {
                // A late writer recreated an already archived day; keep both
                merge_into(&path, &dest)?;
            } else {
                fs::rename(&path, &dest).map_err(|e| VaultError::io(&path, e))?;
            }
            info!(file = %name, "archived audit log");
            report.archived.push(name);
        }

        let cutoff = today - chrono::Duration::days(retention_days);
        for path in list_files(&self.archive_dir, |n| n.ends_with("_audit.jsonl"))? {
            let Some(date) = log_date(&path) else { continue };
            if date < cutoff {
                let name = file_name_of(&path);
                fs::remove_file(&path).map_err(|e| VaultError::io(&path, e))?;
                info!(file = %name, retention_days, "deleted expired audit log");
                report.deleted.push(name);
            }
        }
        Ok(report)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Date encoded in `YYYY-MM-DD_audit.jsonl`
pub fn log_date(path: &Path) -> Option<NaiveDate> {
    let name = file_name_of(path);
    let date = name.split('_').next()?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn merge_into(src: &Path, dest: &Path) -> Result<(), VaultError> {
    let data = fs::read(src).map_err(|e| VaultError::io(src, e))?;
    let mut out = OpenOptions::new()
        .append(true)
        .open(dest)
        .map_err(|e| VaultError::io(dest, e))?;
    out.write_all(&data).map_err(|e| VaultError::io(dest, e))?;
    fs::remove_file(src).map_err(|e| VaultError::io(src, e))
}
