//! Multi-step plans built from classified tasks.
//!
//! Related tasks are grouped before planning: an invoice request seen
//! together with a late-fee notice becomes one `cross_domain_recovery` plan
//! instead of two unrelated ones.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::classifier::Classification;

/// Tool prefixes that act outside the vault and therefore need approval
pub const EXTERNAL_TOOLS: [&str; 4] = ["odoo.", "gmail.", "calendar.", "social."];

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Critical => "Critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    pub tool: String,
    pub detail: String,
    /// Payload handed to the executor if the step is approved
    #[serde(default)]
    pub params: Value,
}

impl Step {
    fn new(action: &str, tool: &str, detail: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.to_string(),
            tool: tool.to_string(),
            detail: detail.into(),
            params,
        }
    }

    pub fn needs_approval(&self) -> bool {
        EXTERNAL_TOOLS.iter().any(|p| self.tool.starts_with(p))
    }
}

/// A classified task feeding a plan
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTask {
    pub name: String,
    pub classification: Classification,
    pub preview: String,
}

impl SourceTask {
    pub fn new(name: impl Into<String>, content: &str, classification: Classification) -> Self {
        let mut preview: String = content
            .chars()
            .take(PREVIEW_CHARS)
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        if content.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        Self {
            name: name.into(),
            classification,
            preview,
        }
    }

    fn intent(&self) -> &str {
        &self.classification.intent
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub title: String,
    pub priority: Priority,
    pub intent: String,
    pub steps: Vec<Step>,
    pub sources: Vec<SourceTask>,
}

impl Plan {
    /// `PLAN_{ts}_{intent}.md`
    pub fn file_name(&self, ts: &str) -> String {
        format!("PLAN_{}_{}.md", ts, self.intent)
    }

    pub fn approval_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.needs_approval())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("---\n");
        out.push_str(&format!("title: {}\n", self.title));
        out.push_str(&format!("priority: {}\n", self.priority));
        out.push_str(&format!("intent: {}\n", self.intent));
        out.push_str(&format!("created: {}\n", Local::now().to_rfc3339()));
        out.push_str("status: pending\n");
        out.push_str("type: plan\n");
        out.push_str("---\n\n");
        out.push_str(&format!("# {}\n\n", self.title));

        out.push_str("## Objectives\n");
        out.push_str("This plan addresses the following detected events:\n");
        for src in &self.sources {
            out.push_str(&format!("- **{}** (`{}`): {}\n", src.intent(), src.name, src.preview));
        }

        out.push_str("\n## Execution Steps\n");
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!(
                "{}. **{}**: {} (Tool: `{}`)\n",
                i + 1,
                step.action,
                step.detail,
                step.tool
            ));
        }

        let gated: Vec<&str> = self.approval_steps().map(|s| s.action.as_str()).collect();
        if !gated.is_empty() {
            out.push_str("\n## Approval Required\n");
            out.push_str(&format!(
                "Submitted to Pending_Approval as separate requests: {}\n",
                gated.join(", ")
            ));
        }
        out
    }
}

/// Group tasks and build one plan per group, highest priority first
pub fn build_plans(tasks: Vec<SourceTask>) -> Vec<Plan> {
    let (recovery, rest): (Vec<_>, Vec<_>) = if has_recovery_pair(&tasks) {
        tasks
            .into_iter()
            .partition(|t| matches!(t.intent(), "invoice_request" | "late_fee_notice"))
    } else {
        (Vec::new(), tasks)
    };

    let mut plans = Vec::new();
    if !recovery.is_empty() {
        plans.push(recovery_plan(recovery));
    }
    plans.extend(rest.into_iter().map(single_plan));
    plans.sort_by(|a, b| b.priority.cmp(&a.priority));
    plans
}

fn has_recovery_pair(tasks: &[SourceTask]) -> bool {
    tasks.iter().any(|t| t.intent() == "invoice_request")
        && tasks.iter().any(|t| t.intent() == "late_fee_notice")
}

fn money(amount: Option<f64>) -> String {
    match amount {
        Some(a) => format!("${:.2}", a),
        None => "an unknown amount".to_string(),
    }
}

fn recovery_plan(group: Vec<SourceTask>) -> Plan {
    let invoice = group
        .iter()
        .find(|t| t.intent() == "invoice_request")
        .map(|t| &t.classification);
    let fee = group
        .iter()
        .find(|t| t.intent() == "late_fee_notice")
        .map(|t| &t.classification);

    let client = invoice
        .and_then(|c| c.entity_str("client"))
        .unwrap_or("Client")
        .to_string();
    let amount = invoice.and_then(|c| c.entity_f64("amount"));
    let fee_amount = fee.and_then(|c| c.entity_f64("amount"));

    Plan {
        title: format!("Financial Recovery: Invoice {} & Handle Late Fee", client),
        priority: Priority::Critical,
        intent: "cross_domain_recovery".to_string(),
        steps: vec![
            Step::new(
                "generate_invoice",
                "odoo.create_draft_invoice",
                format!("Create invoice for {} amount {}", client, money(amount)),
                json!({"client": client, "amount": amount}),
            ),
            Step::new(
                "request_approval",
                "human_approval",
                "Submit invoice for approval before sending",
                Value::Null,
            ),
            Step::new(
                "log_accounting",
                "odoo.record_expense",
                format!("Log late fee of {} in the expense ledger", money(fee_amount)),
                json!({"category": "late_fee", "amount": fee_amount}),
            ),
            Step::new(
                "update_dashboard",
                "vault_writer.update_dashboard",
                "Update Dashboard.md with the new financial status",
                Value::Null,
            ),
            Step::new(
                "proactive_suggestion",
                "llm.generate_text",
                "Draft a suggestion to move net-30 terms to net-15 to avoid future fees",
                Value::Null,
            ),
        ],
        sources: group,
    }
}

fn single_plan(task: SourceTask) -> Plan {
    let c = &task.classification;
    let client = c.entity_str("client").unwrap_or("Client").to_string();
    let amount = c.entity_f64("amount");

    let (title, priority, steps) = match c.intent.as_str() {
        "invoice_request" => (
            format!("Invoice Request: {}", client),
            Priority::High,
            vec![
                Step::new(
                    "generate_invoice",
                    "odoo.create_draft_invoice",
                    format!("Create invoice for {} amount {}", client, money(amount)),
                    json!({"client": client, "amount": amount}),
                ),
                Step::new(
                    "send_invoice",
                    "gmail.send",
                    format!("Email the invoice to {}", client),
                    json!({"client": client, "amount": amount}),
                ),
            ],
        ),
        "late_fee_notice" => (
            format!("Process Late Fee: {}", money(amount)),
            Priority::Medium,
            vec![
                Step::new(
                    "log_expense",
                    "odoo.record_expense",
                    format!("Record late fee of {}", money(amount)),
                    json!({"category": "late_fee", "amount": amount}),
                ),
                Step::new(
                    "update_dashboard",
                    "vault_writer.update_dashboard",
                    "Reflect the fee on the dashboard",
                    Value::Null,
                ),
            ],
        ),
        "payment_received" => (
            format!("Record Payment: {}", money(amount)),
            Priority::Medium,
            vec![Step::new(
                "record_payment",
                "odoo.record_payment",
                format!("Reconcile incoming payment of {}", money(amount)),
                json!({"client": client, "amount": amount}),
            )],
        ),
        "meeting_request" => (
            "Meeting Request".to_string(),
            Priority::Medium,
            vec![Step::new(
                "schedule_meeting",
                "calendar.create_event",
                format!("Propose a slot based on {}", task.name),
                json!({"source": task.name}),
            )],
        ),
        "email_request" | "odoo_invoice_request" | "social_post" => {
            let tool = match c.domain.as_str() {
                "finance" => "odoo.create_invoice".to_string(),
                "communication" => "gmail.send".to_string(),
                _ => format!("social.{}", c.action),
            };
            let priority = if c.domain == "finance" {
                Priority::High
            } else {
                Priority::Medium
            };
            (
                format!("Direct Action: {}", c.action),
                priority,
                vec![Step::new(
                    &c.action,
                    &tool,
                    format!("Carry out the instruction in {}", task.name),
                    Value::Object(c.entities.clone()),
                )],
            )
        }
        _ => (
            format!("Review: {}", task.name),
            Priority::Low,
            vec![Step::new(
                "review",
                "human_review",
                "No automatic handling matched; review manually",
                Value::Null,
            )],
        ),
    };

    let intent = if c.intent == "unknown" {
        "review".to_string()
    } else {
        c.intent.clone()
    };

    Plan {
        title,
        priority,
        intent,
        steps,
        sources: vec![task],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KeywordClassifier;

    fn task(name: &str, text: &str) -> SourceTask {
        let k = KeywordClassifier::new().unwrap();
        SourceTask::new(name, text, k.classify_text(text))
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_cross_domain_grouping() {
        let plans = build_plans(vec![
            task("a.md", "$1500 invoice for Client A"),
            task("b.md", "$35 overdue late fee"),
            task("c.md", "Can we schedule a meeting?"),
        ]);

        assert_eq!(plans.len(), 2);
        let recovery = &plans[0];
        assert_eq!(recovery.intent, "cross_domain_recovery");
        assert_eq!(recovery.priority, Priority::Critical);
        assert!(recovery.steps.len() >= 4);
        assert_eq!(recovery.steps[0].action, "generate_invoice");
        assert_eq!(recovery.steps[2].action, "log_accounting");
        assert_eq!(recovery.sources.len(), 2);
        assert!(recovery.steps[0].detail.contains("$1500.00"));
        assert!(recovery.steps[2].detail.contains("$35.00"));

        let gated: Vec<_> = recovery.approval_steps().map(|s| s.action.as_str()).collect();
        assert_eq!(gated, vec!["generate_invoice", "log_accounting"]);

        assert_eq!(plans[1].intent, "meeting_request");
    }

    #[test]
    fn test_invoice_alone_is_not_recovery() {
        let plans = build_plans(vec![task("a.md", "Invoice for Client B please")]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].intent, "invoice_request");
        assert_eq!(plans[0].priority, Priority::High);
        assert_eq!(plans[0].approval_steps().count(), 2);
    }

    #[test]
    fn test_unknown_becomes_review_without_approvals() {
        let plans = build_plans(vec![task("x.md", "hello there")]);
        assert_eq!(plans[0].intent, "review");
        assert_eq!(plans[0].priority, Priority::Low);
        assert_eq!(plans[0].approval_steps().count(), 0);
    }

    #[test]
    fn test_direct_action_carries_payload() {
        let plans = build_plans(vec![task(
            "mail.md",
            "send an email to bob@example.com\nSubject: Hi\nBody: See you",
        )]);
        let step = &plans[0].steps[0];
        assert_eq!(step.action, "send_email");
        assert_eq!(step.tool, "gmail.send");
        assert_eq!(step.params["to"], "bob@example.com");
    }

    #[test]
    fn test_render_front_matter() {
        let plans = build_plans(vec![
            task("a.md", "$1500 invoice for Client A"),
            task("b.md", "$35 overdue late fee"),
        ]);
        let text = plans[0].render();
        assert!(text.starts_with("---\ntitle: Financial Recovery: Invoice Client A"));
        assert!(text.contains("priority: Critical"));
        assert!(text.contains("1. **generate_invoice**"));
        assert!(text.contains("5. **proactive_suggestion**"));
        assert!(text.contains("(`b.md`)"));
        assert_eq!(plans[0].file_name("20240101_090000"), "PLAN_20240101_090000_cross_domain_recovery.md");
    }

    #[test]
    fn test_preview_truncated() {
        let long = "x".repeat(150);
        let t = task("l.md", &long);
        assert_eq!(t.preview.len(), 103);
        assert!(t.preview.ends_with("..."));
    }
}
