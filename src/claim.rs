//! Multi-agent claim protocol over `Needs_Action`.
//!
//! A claim is the file's presence under `In_Progress/<agent-id>/`. In the
//! default [`ClaimMode::Optimistic`] mode `claim` checks every agent directory
//! and then renames; two agents can both pass the check before either moves.
//! Only one rename can succeed for a given source, and the loser sees
//! `SourceMissing`, but an agent that re-lists after the winner already moved
//! the file on could still act on a stale read. Downstream handling is
//! idempotent through the dedupe ledger.
//!
//! [`ClaimMode::Marker`] closes the window: the agent first creates
//! `In_Progress/.claims/<name>.claim` with `create_new`, which exactly one
//! process can win, and only then moves the file.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::VaultError;
use crate::vault::{file_name, Location, MoveOutcome, Vault, VaultState};

/// Markers older than this whose file never left Needs_Action belong to a
/// crashed claimer and may be taken over
const MARKER_STALE_AFTER: Duration = Duration::from_secs(300);

const MARKER_DIR: &str = ".claims";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMode {
    #[default]
    Optimistic,
    Marker,
}

#[derive(Debug, Clone)]
pub struct ClaimManager {
    vault: Vault,
    agent_id: String,
    mode: ClaimMode,
}

impl ClaimManager {
    pub fn new(vault: Vault, agent_id: impl Into<String>, mode: ClaimMode) -> Self {
        Self {
            vault,
            agent_id: agent_id.into(),
            mode,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Whether any agent currently holds a file with this name
    pub fn is_claimed(&self, name: &str) -> Result<bool, VaultError> {
        for agent in self.vault.agents()? {
            if self.vault.agent_dir(&agent).join(name).exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Try to move a Needs_Action file into this agent's directory.
    /// Returns the claimed path, or `None` if someone else got it first.
    pub fn claim(&self, path: &Path) -> Result<Option<PathBuf>, VaultError> {
        let name = file_name(path)?;
        if self.is_claimed(&name)? {
            debug!(file = %name, "already claimed by another agent");
            return Ok(None);
        }

        if self.mode == ClaimMode::Marker && !self.acquire_marker(&name, path)? {
            debug!(file = %name, "claim marker held elsewhere");
            return Ok(None);
        }

        match self
            .vault
            .transition(path, &Location::claimed_by(&self.agent_id))?
        {
            MoveOutcome::Moved(dest) => {
                info!(file = %name, agent = %self.agent_id, "claimed task");
                Ok(Some(dest))
            }
            MoveOutcome::SourceMissing => {
                self.release(&name);
                Ok(None)
            }
        }
    }

    /// Files this agent holds, e.g. left over from a crash mid-cycle
    pub fn held(&self) -> Result<Vec<PathBuf>, VaultError> {
        self.vault.list(&Location::claimed_by(&self.agent_id))
    }

    /// Drop the claim marker once the file has left In_Progress.
    /// A no-op in optimistic mode.
    pub fn release(&self, name: &str) {
        if self.mode == ClaimMode::Marker {
            self.remove_marker(name);
        }
    }

    /// Exclusive right to execute an approved request, whatever the claim
    /// mode. Approved files never enter In_Progress, so the marker alone
    /// decides. A marker this agent left behind is its own crash and is taken
    /// back; one written by another agent is respected.
    pub fn claim_approval(&self, name: &str) -> Result<bool, VaultError> {
        let marker = self.marker_path(name);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        match self.create_marker(&marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = marker_owner(&marker);
                if owner.as_deref() == Some(self.agent_id.as_str()) {
                    warn!(file = %name, "resuming approval left by an earlier run");
                    return Ok(true);
                }
                debug!(file = %name, ?owner, "approval held by another agent");
                Ok(false)
            }
            Err(e) => Err(VaultError::io(&marker, e)),
        }
    }

    pub fn release_approval(&self, name: &str) {
        self.remove_marker(name);
    }

    fn remove_marker(&self, name: &str) {
        let marker = self.marker_path(name);
        if let Err(e) = fs::remove_file(&marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(marker = %marker.display(), error = %e, "failed to remove claim marker");
            }
        }
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.vault
            .dir(VaultState::InProgress)
            .join(MARKER_DIR)
            .join(format!("{}.claim", name))
    }

    fn acquire_marker(&self, name: &str, source: &Path) -> Result<bool, VaultError> {
        let marker = self.marker_path(name);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        match self.create_marker(&marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if source.exists() && marker_is_stale(&marker) {
                    warn!(marker = %marker.display(), "taking over stale claim marker");
                    let _ = fs::remove_file(&marker);
                    return match self.create_marker(&marker) {
                        Ok(()) => Ok(true),
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                        Err(e) => Err(VaultError::io(&marker, e)),
                    };
                }
                Ok(false)
            }
            Err(e) => Err(VaultError::io(&marker, e)),
        }
    }

    fn create_marker(&self, marker: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(marker)?;
        writeln!(file, "{} {}", self.agent_id, std::process::id())
    }
}

/// Agent id recorded in a marker
fn marker_owner(marker: &Path) -> Option<String> {
    fs::read_to_string(marker)
        .ok()?
        .split_whitespace()
        .next()
        .map(String::from)
}

fn marker_is_stale(marker: &Path) -> bool {
    fs::metadata(marker)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age >= MARKER_STALE_AFTER)
        .unwrap_or(false)
}
