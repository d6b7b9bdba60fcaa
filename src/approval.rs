//! Approval request files and waiting on a human decision.
//!
//! ```text
//! ---
//! action: generate_invoice
//! tool: odoo.create_draft_invoice
//! plan_file: PLAN_20240506_090000_cross_domain_recovery.md
//! status: pending
//! details: {"amount":1500.0,"client":"Client A"}
//! ---
//!
//! ## generate_invoice
//! ...
//! ```
//!
//! The `status` key is only a hint for readers. The directory the file sits
//! in is the decision.

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::VaultError;
use crate::vault::{timestamp_micros, Vault, VaultState};

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub action: String,
    pub tool: Option<String>,
    pub plan_file: Option<String>,
    pub status: String,
    pub params: Value,
    /// Free text after the header
    pub body: String,
}

impl ApprovalRequest {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            tool: None,
            plan_file: None,
            status: "pending".to_string(),
            params,
            body: String::new(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_plan(mut self, plan_file: impl Into<String>) -> Self {
        self.plan_file = Some(plan_file.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// `APPROVAL_{action}_{ts}.md` with a microsecond timestamp
    pub fn file_name(&self) -> String {
        format!("APPROVAL_{}_{}.md", self.action, timestamp_micros())
    }

    /// Who or what the action is aimed at, for the audit trail
    pub fn target(&self) -> String {
        ["to", "client_id", "client", "platform"]
            .iter()
            .find_map(|k| match self.params.get(*k) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "n/a".to_string())
    }

    pub fn render(&self) -> Result<String, VaultError> {
        let mut out = String::from("---\n");
        out.push_str(&format!("action: {}\n", self.action));
        if let Some(tool) = &self.tool {
            out.push_str(&format!("tool: {}\n", tool));
        }
        if let Some(plan) = &self.plan_file {
            out.push_str(&format!("plan_file: {}\n", plan));
        }
        out.push_str(&format!("status: {}\n", self.status));
        out.push_str(&format!("details: {}\n", serde_json::to_string(&self.params)?));
        out.push_str("---\n\n");
        if !self.body.is_empty() {
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str("## To Approve\nMove this file to the Approved folder.\n\n");
        out.push_str("## To Reject\nMove this file to the Rejected folder.\n");
        Ok(out)
    }

    /// Parse a request file. Header keys other than the known ones are folded
    /// into `params` as strings, which keeps hand-written requests usable.
    pub fn parse(name: &str, text: &str) -> Result<Self, VaultError> {
        let malformed = |reason: &str| VaultError::Malformed {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some("---") {
            return Err(malformed("missing '---' header"));
        }

        let mut action = None;
        let mut tool = None;
        let mut plan_file = None;
        let mut status = "pending".to_string();
        let mut details: Option<Value> = None;
        let mut extra = Map::new();
        let mut closed = false;

        for line in lines.by_ref() {
            let line = line.trim_end();
            if line.trim() == "---" {
                closed = true;
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(malformed(&format!("header line without ':': {}", line)));
            };
            let value = value.trim();
            match key.trim() {
                "action" => action = Some(value.to_string()),
                "tool" => tool = Some(value.to_string()),
                "plan_file" => plan_file = Some(value.to_string()),
                "status" => status = value.to_string(),
                "details" => {
                    let parsed: Value = serde_json::from_str(value)
                        .map_err(|e| malformed(&format!("details is not JSON: {}", e)))?;
                    details = Some(parsed);
                }
                other => {
                    extra.insert(other.to_string(), Value::String(value.to_string()));
                }
            }
        }
        if !closed {
            return Err(malformed("unterminated header"));
        }

        let action = action
            .filter(|a| !a.is_empty())
            .ok_or_else(|| malformed("missing action"))?;

        let params = match details {
            Some(Value::Object(mut map)) => {
                for (k, v) in extra {
                    map.entry(k).or_insert(v);
                }
                Value::Object(map)
            }
            Some(Value::Null) | None => Value::Object(extra),
            Some(_) => return Err(malformed("details must be a JSON object")),
        };

        let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();

        Ok(Self {
            action,
            tool,
            plan_file,
            status,
            params,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

/// Poll the vault until a human moves `name` out of Pending_Approval.
///
/// A file already executed and moved to Done counts as approved. Gives up
/// with [`VaultError::ApprovalTimeout`] once `timeout` has elapsed.
pub async fn wait_for_decision(
    vault: &Vault,
    name: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<Decision, VaultError> {
    let started = Instant::now();
    info!(file = %name, timeout_secs = timeout.as_secs(), "waiting for human decision");
    loop {
        for location in vault.find(name)? {
            match location.state {
                VaultState::Approved | VaultState::Done => {
                    info!(file = %name, "approved");
                    return Ok(Decision::Approved);
                }
                VaultState::Rejected => {
                    info!(file = %name, "rejected");
                    return Ok(Decision::Rejected);
                }
                _ => {}
            }
        }

        if started.elapsed() >= timeout {
            return Err(VaultError::ApprovalTimeout {
                name: name.to_string(),
                secs: timeout.as_secs(),
            });
        }
        debug!(file = %name, "no decision yet");
        tokio::time::sleep(poll.min(timeout.saturating_sub(started.elapsed()))).await;
    }
}
