//! Vault state machine: the directory taxonomy and the atomic moves between it.
//!
//! A file's state is the directory it lives in. Every transition is a single
//! `rename(2)` inside the vault root, so a file always has exactly one
//! authoritative location. Before renaming, the mover re-checks that the
//! source still exists; a vanished source means another process already
//! consumed it and the move is reported as [`MoveOutcome::SourceMissing`]
//! rather than an error.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::VaultError;

/// Directory that holds per-agent claim subdirectories
pub const IN_PROGRESS_DIR: &str = "In_Progress";

/// Every directory a tracked file may occupy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultState {
    Inbox,
    NeedsAction,
    Plans,
    PendingApproval,
    Approved,
    Rejected,
    InProgress,
    Done,
    Quarantine,
    Alerts,
    Logs,
    Archive,
}

impl VaultState {
    pub const ALL: [VaultState; 12] = [
        VaultState::Inbox,
        VaultState::NeedsAction,
        VaultState::Plans,
        VaultState::PendingApproval,
        VaultState::Approved,
        VaultState::Rejected,
        VaultState::InProgress,
        VaultState::Done,
        VaultState::Quarantine,
        VaultState::Alerts,
        VaultState::Logs,
        VaultState::Archive,
    ];

    /// Path of the state directory relative to the vault root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::NeedsAction => "Needs_Action",
            Self::Plans => "Plans",
            Self::PendingApproval => "Pending_Approval",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::InProgress => IN_PROGRESS_DIR,
            Self::Done => "Done",
            Self::Quarantine => "Quarantine",
            Self::Alerts => "Alerts",
            Self::Logs => "Logs",
            Self::Archive => "Logs/Archive",
        }
    }

    /// Whether the state machine allows moving a file from `self` to `to`
    pub fn can_transition(&self, to: VaultState) -> bool {
        use VaultState::*;
        if to == Quarantine {
            return *self != Quarantine;
        }
        matches!(
            (*self, to),
            (Inbox, NeedsAction)
                | (Inbox, Plans)
                | (NeedsAction, InProgress)
                | (InProgress, PendingApproval)
                | (InProgress, Done)
                | (Plans, Done)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Done)
                | (Logs, Archive)
        )
    }
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// A state plus, for `In_Progress`, the owning agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub state: VaultState,
    pub agent: Option<String>,
}

impl Location {
    pub fn of(state: VaultState) -> Self {
        Self { state, agent: None }
    }

    pub fn claimed_by(agent: impl Into<String>) -> Self {
        Self {
            state: VaultState::InProgress,
            agent: Some(agent.into()),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent {
            Some(agent) => write!(f, "{}/{}", self.state, agent),
            None => write!(f, "{}", self.state),
        }
    }
}

/// What a vault file represents, derived from its naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Task,
    Plan,
    Approval,
    Report,
    AuditLog,
}

impl ItemKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("APPROVAL_") {
            Self::Approval
        } else if name.starts_with("PLAN_") {
            Self::Plan
        } else if name.starts_with("FAILURE_") || name.starts_with("CRITICAL_ALERT_") {
            Self::Report
        } else if name.ends_with("_audit.jsonl") {
            Self::AuditLog
        } else {
            Self::Task
        }
    }
}

/// A file observed in the vault together with where it currently lives
#[derive(Debug, Clone)]
pub struct VaultItem {
    pub name: String,
    pub kind: ItemKind,
    pub location: Location,
    pub path: PathBuf,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved(PathBuf),
    /// The source was gone when we looked; someone else consumed it
    SourceMissing,
}

impl MoveOutcome {
    pub fn moved(&self) -> Option<&Path> {
        match self {
            Self::Moved(p) => Some(p),
            Self::SourceMissing => None,
        }
    }
}

/// Handle on a vault root
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: VaultState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    pub fn agent_dir(&self, agent: &str) -> PathBuf {
        self.dir(VaultState::InProgress).join(agent)
    }

    pub fn location_dir(&self, location: &Location) -> PathBuf {
        match (&location.state, &location.agent) {
            (VaultState::InProgress, Some(agent)) => self.agent_dir(agent),
            (state, _) => self.dir(*state),
        }
    }

    pub fn briefings_dir(&self) -> PathBuf {
        self.root.join("Briefings")
    }

    pub fn accounting_dir(&self) -> PathBuf {
        self.root.join("Accounting")
    }

    /// Create every state directory plus the given agents' claim directories.
    /// Idempotent.
    pub fn ensure_layout(&self, agents: &[&str]) -> Result<(), VaultError> {
        let mut dirs: Vec<PathBuf> = VaultState::ALL.iter().map(|s| self.dir(*s)).collect();
        dirs.push(self.briefings_dir());
        dirs.push(self.accounting_dir());
        dirs.extend(agents.iter().map(|a| self.agent_dir(a)));
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
        }
        info!(root = %self.root.display(), "vault layout ready");
        Ok(())
    }

    /// Work out which state a path inside the vault belongs to
    pub fn locate(&self, path: &Path) -> Result<Location, VaultError> {
        let parent = path
            .parent()
            .ok_or_else(|| VaultError::UnknownLocation(path.to_path_buf()))?;
        let rel = parent
            .strip_prefix(&self.root)
            .map_err(|_| VaultError::UnknownLocation(path.to_path_buf()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");

        if let Some(agent) = rel.strip_prefix(&format!("{}/", IN_PROGRESS_DIR)) {
            if !agent.is_empty() && !agent.contains('/') {
                return Ok(Location::claimed_by(agent));
            }
        }
        VaultState::ALL
            .iter()
            .find(|s| **s != VaultState::InProgress && s.dir_name() == rel)
            .map(|s| Location::of(*s))
            .ok_or_else(|| VaultError::UnknownLocation(path.to_path_buf()))
    }

    /// Describe a file as a vault item
    pub fn item(&self, path: &Path) -> Result<VaultItem, VaultError> {
        let name = file_name(path)?;
        Ok(VaultItem {
            kind: ItemKind::from_name(&name),
            location: self.locate(path)?,
            path: path.to_path_buf(),
            name,
        })
    }

    /// Move `src` into `to`, enforcing the transition table.
    ///
    /// The caller that initiates the rename owns the file for its duration;
    /// nobody else should write to it while it moves.
    pub fn transition(&self, src: &Path, to: &Location) -> Result<MoveOutcome, VaultError> {
        let name = file_name(src)?;
        let from = self.locate(src)?;
        if !from.state.can_transition(to.state) {
            return Err(VaultError::IllegalTransition {
                name,
                from: from.state,
                to: to.state,
            });
        }

        // Re-verify right before the rename; losing this race is not an error
        if fs::symlink_metadata(src).is_err() {
            debug!(file = %name, from = %from, "source already gone, skipping move");
            return Ok(MoveOutcome::SourceMissing);
        }

        let dest_dir = self.location_dir(to);
        fs::create_dir_all(&dest_dir).map_err(|e| VaultError::io(&dest_dir, e))?;
        let dest = unique_destination(&dest_dir, &name);

        match fs::rename(src, &dest) {
            Ok(()) => {
                info!(file = %name, from = %from, to = %to, "moved");
                Ok(MoveOutcome::Moved(dest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %name, "source vanished during rename");
                Ok(MoveOutcome::SourceMissing)
            }
            Err(e) => Err(VaultError::io(src, e)),
        }
    }

    /// Markdown files directly inside a location, oldest name first
    pub fn list(&self, location: &Location) -> Result<Vec<PathBuf>, VaultError> {
        list_files(&self.location_dir(location), |name| name.ends_with(".md"))
    }

    /// Agent directories currently present under In_Progress
    pub fn agents(&self) -> Result<Vec<String>, VaultError> {
        let dir = self.dir(VaultState::InProgress);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(&dir, e)),
        };
        let mut agents = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && !name.starts_with('.') {
                agents.push(name);
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Every live location currently holding a file with this name
    pub fn find(&self, name: &str) -> Result<Vec<Location>, VaultError> {
        let mut found = Vec::new();
        for state in VaultState::ALL {
            if state == VaultState::InProgress {
                for agent in self.agents()? {
                    if self.agent_dir(&agent).join(name).exists() {
                        found.push(Location::claimed_by(agent));
                    }
                }
            } else if self.dir(state).join(name).exists() {
                found.push(Location::of(state));
            }
        }
        Ok(found)
    }

    /// Write a new file into a location so readers never observe partial
    /// content: write a hidden temp file in the same directory, fsync, rename.
    pub fn write_new(
        &self,
        location: &Location,
        name: &str,
        content: &str,
    ) -> Result<PathBuf, VaultError> {
        let dir = self.location_dir(location);
        fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
        let dest = unique_destination(&dir, name);
        let tmp = dir.join(format!(".{}.tmp", name));
        {
            let mut file = fs::File::create(&tmp).map_err(|e| VaultError::io(&tmp, e))?;
            file.write_all(content.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| VaultError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &dest).map_err(|e| VaultError::io(&dest, e))?;
        debug!(file = %dest.display(), "wrote vault file");
        Ok(dest)
    }
}

/// Local `%Y%m%d_%H%M%S` stamp used in generated file names
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Like [`timestamp`] with a microsecond suffix
pub fn timestamp_micros() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

pub(crate) fn file_name(path: &Path) -> Result<String, VaultError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| VaultError::UnknownLocation(path.to_path_buf()))
}

/// Regular, non-hidden files in `dir` whose names satisfy `keep`, sorted
pub(crate) fn list_files<F>(dir: &Path, keep: F) -> Result<Vec<PathBuf>, VaultError>
where
    F: Fn(&str) -> bool,
{
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::io(dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !path.is_file() {
            continue;
        }
        if keep(&name) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `dir/name`, or `dir/stem_N.ext` when a file with that name is already there
fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
