//! Reports written to `Briefings/`: the weekly audit summary and the Monday
//! CEO briefing built from the accounting ledgers and `Business_Goals.md`.

use chrono::{DateTime, Datelike, Local, NaiveDate};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::error::VaultError;
use crate::vault::{Vault, VaultState};

/// Days covered by a weekly summary, ending the day before it is generated
pub const SUMMARY_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub total_actions: usize,
    pub approvals: usize,
    pub failures: usize,
    pub actions_by_type: BTreeMap<String, usize>,
}

impl AuditSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.total_actions += 1;
            *summary
                .actions_by_type
                .entry(entry.action_type.clone())
                .or_default() += 1;
            if entry.result == AuditResult::Failure {
                summary.failures += 1;
            }
            if entry.approval_status == "approved" {
                summary.approvals += 1;
            }
        }
        summary
    }

    pub fn render(&self) -> String {
        let period = match (self.from, self.to) {
            (Some(from), Some(to)) => format!("{} to {}", from, to),
            _ => "n/a".to_string(),
        };
        let mut out = String::from("# Weekly System Audit Summary\n\n");
        out.push_str(&format!("**Period:** {}\n", period));
        out.push_str(&format!("**Total Actions Logged:** {}\n", self.total_actions));
        out.push_str(&format!("**Total Approvals:** {}\n", self.approvals));
        out.push_str(&format!("**Failures Detected:** {}\n\n", self.failures));
        out.push_str("## Action Distribution\n");
        if self.actions_by_type.is_empty() {
            out.push_str("- No actions recorded\n");
        }
        for (action, count) in &self.actions_by_type {
            out.push_str(&format!("- **{}**: {}\n", action, count));
        }
        out
    }
}

/// Summarise the seven days before `today` and write
/// `Briefings/{today}_Weekly_Audit_Summary.md`
pub fn weekly_summary(
    vault: &Vault,
    audit: &AuditLogger,
    today: NaiveDate,
) -> Result<(PathBuf, AuditSummary), VaultError> {
    let mut entries = Vec::new();
    for offset in 1..=SUMMARY_DAYS {
        let day = today - chrono::Duration::days(offset);
        entries.extend(audit.entries_for(day)?);
    }

    let mut summary = AuditSummary::from_entries(&entries);
    summary.from = Some(today - chrono::Duration::days(SUMMARY_DAYS));
    summary.to = Some(today - chrono::Duration::days(1));

    let dir = vault.briefings_dir();
    fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
    let path = dir.join(format!("{}_Weekly_Audit_Summary.md", today.format("%Y-%m-%d")));
    fs::write(&path, summary.render()).map_err(|e| VaultError::io(&path, e))?;
    info!(path = %path.display(), total = summary.total_actions, "weekly summary written");

    audit.log_best_effort(
        "generate_briefing",
        &path.display().to_string(),
        json!({
            "total_actions": summary.total_actions,
            "failures": summary.failures,
            "approvals": summary.approvals,
        }),
        AuditResult::Success,
    );
    Ok((path, summary))
}

/// Business goals file at the vault root
pub const GOALS_FILE: &str = "Business_Goals.md";
/// Revenue target used when no monthly goal is set
pub const DEFAULT_REVENUE_TARGET: f64 = 10_000.0;
/// Days of audit history searched for tool activity
pub const ACTIVITY_DAYS: i64 = 30;
const HIGH_COST: f64 = 100.0;

/// Known subscriptions: match pattern, tool name, category
const SUBSCRIPTIONS: &[(&str, &str, &str)] = &[
    ("netflix.com", "Netflix", "Other"),
    ("spotify.com", "Spotify", "Other"),
    ("adobe.com", "Adobe Creative Cloud", "Design"),
    ("notion.so", "Notion", "Productivity"),
    ("slack.com", "Slack", "Productivity"),
    ("aws.amazon.com", "AWS", "Infrastructure"),
    ("openai.com", "OpenAI", "AI"),
    ("zoho.com", "Zoho Books", "Accounting"),
    ("odoo.com", "Odoo", "Accounting"),
    ("stripe.com", "Stripe", "Payment Gateway"),
    ("upwork.com", "Upwork", "Freelance"),
];

/// One money movement read from `Accounting/`. Income is positive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub amount: f64,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub tool: String,
    pub category: String,
    pub average_cost: f64,
    pub high_cost: bool,
    /// No audit entry mentions the tool in the last [`ACTIVITY_DAYS`]
    pub inactive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CeoBriefing {
    pub date: Option<NaiveDate>,
    pub revenue: f64,
    pub expenses: f64,
    pub target: f64,
    pub subscriptions: Vec<Subscription>,
    /// Categories paid for more than once, with the tools in each
    pub redundant: BTreeMap<String, Vec<String>>,
    pub completed_this_week: usize,
}

impl CeoBriefing {
    pub fn net(&self) -> f64 {
        self.revenue - self.expenses
    }

    pub fn target_pct(&self) -> f64 {
        if self.target > 0.0 {
            self.revenue / self.target * 100.0
        } else {
            0.0
        }
    }

    /// Under half the target past the middle of the month
    pub fn revenue_behind(&self) -> bool {
        self.target_pct() < 50.0 && self.date.is_some_and(|d| d.day() > 15)
    }

    pub fn render(&self) -> String {
        let date = self
            .date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let mut out = format!(
            "---\ntype: briefing\ndate: {date}\ntags: #briefing #ceo\n---\n\n\
             # Monday Morning CEO Briefing: {date}\n\n\
             ## 1. Executive Summary\n\
             - **Revenue MTD**: {} ({:.1}% of {} Target)\n\
             - **Expenses MTD**: {}\n\
             - **Net Income**: {}\n\n\
             ## 2. Subscription Audit\n\
             | Tool | Category | Cost | Usage | Cost Alert |\n\
             |---|---|---|---|---|\n",
            dollars(self.revenue, 2),
            self.target_pct(),
            dollars(self.target, 0),
            dollars(self.expenses, 2),
            dollars(self.net(), 2),
        );
        if self.subscriptions.is_empty() {
            out.push_str("| - | - | - | - | - |\n");
        }
        for sub in &self.subscriptions {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                sub.tool,
                sub.category,
                dollars(sub.average_cost, 2),
                if sub.inactive { "No activity 30d" } else { "Active" },
                if sub.high_cost { "High cost" } else { "OK" },
            ));
        }
        if !self.redundant.is_empty() {
            out.push_str("\n### Redundancy Alert\n");
            for (category, tools) in &self.redundant {
                out.push_str(&format!(
                    "- **{}**: multiple tools ({}). Consider consolidating.\n",
                    category,
                    tools.join(", ")
                ));
            }
        }

        out.push_str(&format!(
            "\n## 3. Bottlenecks & Productivity\n- **Tasks Completed this week**: {}\n\n\
             ## 4. Proactive Suggestions\n",
            self.completed_this_week
        ));
        let mut suggestions = 0;
        if self.revenue_behind() {
            out.push_str(&format!(
                "- **Revenue Alert**: revenue is below 50% of target mid-month ({}). \
                 Follow up on outstanding invoices.\n",
                dollars(self.revenue, 2)
            ));
            suggestions += 1;
        }
        for sub in self.subscriptions.iter().filter(|s| s.inactive) {
            out.push_str(&format!(
                "- **Unused Subscription**: {} shows no activity. Potential savings: {}/mo.\n",
                sub.tool,
                dollars(sub.average_cost, 2)
            ));
            suggestions += 1;
        }
        if suggestions == 0 {
            out.push_str("- Nothing to flag this week\n");
        }
        out
    }
}

/// Monthly revenue target from a `Monthly goal: $12,500` line
pub fn revenue_target(goals: &str) -> Option<f64> {
    let re = Regex::new(r"(?i)monthly goal:\s*\$([\d,]+(?:\.\d+)?)").ok()?;
    let caps = re.captures(goals)?;
    parse_amount(&caps[1])
}

fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    cleaned.parse().ok()
}

fn table_cells(line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    if !line.starts_with('|') {
        return None;
    }
    Some(
        line.trim_matches('|')
            .split('|')
            .map(|c| c.trim().to_string())
            .collect(),
    )
}

fn is_separator(cells: &[String]) -> bool {
    cells
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':')))
}

/// Read every markdown table with an Amount column.
///
/// Tables with a Date/Description layout carry signed amounts. Tables with an
/// Action column are executor ledgers: rows whose action or tool names an
/// expense count as money out, payments as money in, dry-run rows and
/// everything else are skipped. `file_date` dates rows that carry no date.
pub fn parse_transactions(text: &str, file_date: Option<NaiveDate>) -> Vec<Transaction> {
    let mut out = Vec::new();
    let mut header: Option<Vec<String>> = None;
    let mut pending: Option<Vec<String>> = None;

    for line in text.lines() {
        let Some(cells) = table_cells(line) else {
            header = None;
            pending = None;
            continue;
        };
        if is_separator(&cells) {
            header = pending.take();
            continue;
        }
        let Some(cols) = &header else {
            pending = Some(cells.iter().map(|c| c.to_lowercase()).collect());
            continue;
        };
        if let Some(txn) = table_row(cols, &cells, file_date) {
            out.push(txn);
        }
    }
    out
}

fn table_row(cols: &[String], cells: &[String], file_date: Option<NaiveDate>) -> Option<Transaction> {
    let col = |name: &str| {
        cols.iter()
            .position(|c| c == name)
            .and_then(|i| cells.get(i))
            .map(String::as_str)
    };
    let amount = parse_amount(col("amount")?)?;
    let date = col("date")
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .or(file_date);

    if let Some(action) = col("action") {
        if col("mode") == Some("dry-run") {
            return None;
        }
        let kind = format!("{} {}", action, col("tool").unwrap_or_default()).to_lowercase();
        let signed = if kind.contains("expense") {
            -amount.abs()
        } else if kind.contains("payment") {
            amount.abs()
        } else {
            return None;
        };
        return Some(Transaction {
            date,
            description: col("target").unwrap_or(action).to_string(),
            amount: signed,
            category: action.to_string(),
        });
    }

    Some(Transaction {
        date,
        description: col("description")
            .or_else(|| cells.get(1).map(String::as_str))
            .unwrap_or_default()
            .to_string(),
        amount,
        category: col("category")
            .filter(|c| !c.is_empty())
            .unwrap_or("Uncategorized")
            .to_string(),
    })
}

/// Group expenses by known tool
pub fn subscriptions(transactions: &[Transaction], activity: &[String]) -> Vec<Subscription> {
    let mut seen: BTreeMap<&str, (&str, Vec<f64>)> = BTreeMap::new();
    for txn in transactions.iter().filter(|t| t.amount < 0.0) {
        let desc = txn.description.to_lowercase();
        if let Some((_, tool, category)) = SUBSCRIPTIONS
            .iter()
            .find(|(pattern, tool, _)| desc.contains(pattern) || desc.contains(&tool.to_lowercase()))
        {
            seen.entry(*tool)
                .or_insert((*category, Vec::new()))
                .1
                .push(txn.amount.abs());
        }
    }

    seen.into_iter()
        .map(|(tool, (category, costs))| {
            let average_cost = costs.iter().sum::<f64>() / costs.len() as f64;
            let needle = tool.to_lowercase();
            Subscription {
                tool: tool.to_string(),
                category: category.to_string(),
                average_cost,
                high_cost: average_cost > HIGH_COST,
                inactive: !activity.iter().any(|line| line.contains(&needle)),
            }
        })
        .collect()
}

fn redundant(subs: &[Subscription]) -> BTreeMap<String, Vec<String>> {
    let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for sub in subs.iter().filter(|s| s.category != "Other") {
        by_category
            .entry(sub.category.clone())
            .or_default()
            .push(sub.tool.clone());
    }
    by_category.retain(|_, tools| tools.len() > 1);
    by_category
}

fn ledger_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_string_lossy();
    NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()
}

fn load_transactions(vault: &Vault, today: NaiveDate) -> Result<Vec<Transaction>, VaultError> {
    let dir = vault.accounting_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::io(&dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| VaultError::io(&dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable ledger");
                continue;
            }
        };
        out.extend(
            parse_transactions(&text, ledger_date(&path))
                .into_iter()
                .filter(|t| t.date.map_or(true, |d| d.year() == today.year() && d.month() == today.month())),
        );
    }
    Ok(out)
}

/// Audit entries of the activity window, lowercased JSON, one per line
fn recent_activity(audit: &AuditLogger, today: NaiveDate) -> Result<Vec<String>, VaultError> {
    let mut lines = Vec::new();
    for offset in 0..ACTIVITY_DAYS {
        for entry in audit.entries_for(today - chrono::Duration::days(offset))? {
            lines.push(serde_json::to_string(&entry)?.to_lowercase());
        }
    }
    Ok(lines)
}

/// Done files modified in the seven days up to `today`
fn completed_since(vault: &Vault, today: NaiveDate) -> Result<usize, VaultError> {
    let dir = vault.dir(VaultState::Done);
    let cutoff = today - chrono::Duration::days(SUMMARY_DAYS);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(VaultError::io(&dir, e)),
    };
    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::io(&dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| VaultError::io(&path, e))?;
        if DateTime::<Local>::from(modified).date_naive() > cutoff {
            count += 1;
        }
    }
    Ok(count)
}

/// Build the CEO briefing for `today` and write
/// `Briefings/{today}_Monday_Briefing.md`
pub fn ceo_briefing(
    vault: &Vault,
    audit: &AuditLogger,
    today: NaiveDate,
) -> Result<(PathBuf, CeoBriefing), VaultError> {
    let goals_path = vault.root().join(GOALS_FILE);
    let target = match fs::read_to_string(&goals_path) {
        Ok(text) => revenue_target(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(VaultError::io(&goals_path, e)),
    }
    .unwrap_or(DEFAULT_REVENUE_TARGET);

    let transactions = load_transactions(vault, today)?;
    let subs = subscriptions(&transactions, &recent_activity(audit, today)?);
    let briefing = CeoBriefing {
        date: Some(today),
        revenue: transactions.iter().filter(|t| t.amount > 0.0).map(|t| t.amount).sum(),
        expenses: transactions.iter().filter(|t| t.amount < 0.0).map(|t| -t.amount).sum(),
        target,
        redundant: redundant(&subs),
        subscriptions: subs,
        completed_this_week: completed_since(vault, today)?,
    };

    let dir = vault.briefings_dir();
    fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
    let path = dir.join(format!("{}_Monday_Briefing.md", today.format("%Y-%m-%d")));
    fs::write(&path, briefing.render()).map_err(|e| VaultError::io(&path, e))?;
    info!(path = %path.display(), revenue = briefing.revenue, "CEO briefing written");

    audit.log_best_effort(
        "generate_briefing",
        &path.display().to_string(),
        json!({
            "kind": "ceo",
            "revenue": briefing.revenue,
            "expenses": briefing.expenses,
            "target": briefing.target,
            "subscriptions": briefing.subscriptions.len(),
        }),
        AuditResult::Success,
    );
    Ok((path, briefing))
}

/// `$12,345.67` style amounts, minus sign in front
fn dollars(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int, frac) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };
    let mut grouped = String::new();
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 && formatted.chars().any(|c| matches!(c, '1'..='9')) {
        "-"
    } else {
        ""
    };
    match frac {
        Some(f) => format!("{}${}.{}", sign, grouped, f),
        None => format!("{}${}", sign, grouped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::VaultState;
    use tempfile::tempdir;

    fn line(action: &str, approval: &str, result: &str) -> String {
        format!(
            r#"{{"timestamp":"t","action_type":"{}","actor":"a","target":"x","parameters":{{}},"approval_status":"{}","approved_by":"human","result":"{}"}}"#,
            action, approval, result
        )
    }

    #[test]
    fn test_summary_reads_archive_and_logs() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&[]).unwrap();
        let audit = AuditLogger::new(&vault, "tester");

        let archive = vault.dir(VaultState::Archive);
        let logs = vault.dir(VaultState::Logs);
        fs::write(
            archive.join("2024-06-05_audit.jsonl"),
            format!("{}\n{}\n", line("send_email", "approved", "success"), line("send_email", "approved", "failure")),
        )
        .unwrap();
        fs::write(logs.join("2024-06-09_audit.jsonl"), format!("{}\nbroken\n", line("process_crash", "n/a", "failure"))).unwrap();
        // Outside the window
        fs::write(archive.join("2024-05-01_audit.jsonl"), format!("{}\n", line("old", "n/a", "success"))).unwrap();
        // Today is not part of the summary
        fs::write(logs.join("2024-06-10_audit.jsonl"), format!("{}\n", line("today", "n/a", "success"))).unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let (path, summary) = weekly_summary(&vault, &audit, today).unwrap();

        assert_eq!(summary.total_actions, 3);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.approvals, 2);
        assert_eq!(summary.actions_by_type["send_email"], 2);
        assert!(path.ends_with("Briefings/2024-06-10_Weekly_Audit_Summary.md"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("**Period:** 2024-06-03 to 2024-06-09"));
        assert!(text.contains("- **process_crash**: 1"));
    }

    #[test]
    fn test_revenue_target_from_goals() {
        assert_eq!(
            revenue_target("## Revenue\nMonthly goal: $12,500\nStretch: $20,000"),
            Some(12_500.0)
        );
        assert_eq!(revenue_target("no goals yet"), None);
    }

    #[test]
    fn test_dollars() {
        assert_eq!(dollars(1_234_567.891, 2), "$1,234,567.89");
        assert_eq!(dollars(10_000.0, 0), "$10,000");
        assert_eq!(dollars(999.0, 0), "$999");
        assert_eq!(dollars(-35.0, 2), "-$35.00");
    }

    #[test]
    fn test_parse_manual_and_executor_tables() {
        let manual = "# June\n\n| Date | Description | Amount | Category |\n|---|---|---|---|\n\
                      | 2024-06-01 | Notion subscription | -20.00 | Software |\n\
                      | 2024-06-05 | Client A payment | $2,000.00 | Income |\n\
                      | 2024-06-06 | Coffee | n/a | Misc |\n";
        let txns = parse_transactions(manual, None);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].amount, -20.0);
        assert_eq!(txns[0].category, "Software");
        assert_eq!(txns[1].amount, 2000.0);
        assert_eq!(txns[1].date, NaiveDate::from_ymd_opt(2024, 6, 5));

        let day = NaiveDate::from_ymd_opt(2024, 6, 3);
        let ledger = "| Time | Action | Tool | Target | Amount | Mode |\n|---|---|---|---|---|---|\n\
                      | 09:00:00 | record_payment | odoo.record_payment | Client B | 3000 | live |\n\
                      | 09:01:00 | log_accounting | odoo.record_expense | late_fee | 35 | live |\n\
                      | 09:02:00 | generate_invoice | odoo.create_draft_invoice | Client C | 900 | live |\n\
                      | 09:03:00 | record_payment | odoo.record_payment | Client D | 700 | dry-run |\n";
        let txns = parse_transactions(ledger, day);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].amount, 3000.0);
        assert_eq!(txns[0].description, "Client B");
        assert_eq!(txns[1].amount, -35.0);
        assert!(txns.iter().all(|t| t.date == day));
    }

    #[test]
    fn test_ceo_briefing_from_vault() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&[]).unwrap();
        let audit = AuditLogger::new(&vault, "tester");

        fs::write(vault.root().join(GOALS_FILE), "# Goals\nMonthly goal: $20,000\n").unwrap();
        fs::write(
            vault.accounting_dir().join("Current_Month.md"),
            "| Date | Description | Amount | Category |\n|---|---|---|---|\n\
             | 2024-06-01 | Notion subscription | -20.00 | Software |\n\
             | 2024-06-02 | Slack monthly | $-150.00 | Software |\n\
             | 2024-06-05 | Client A payment | 2,000.00 | Income |\n\
             | 2024-05-28 | AWS | -50 | Infra |\n",
        )
        .unwrap();
        fs::write(
            vault.accounting_dir().join("2024-06-03_Ledger.md"),
            "# Accounting Ledger 2024-06-03\n\n\
             | Time | Action | Tool | Target | Amount | Mode |\n|---|---|---|---|---|---|\n\
             | 09:00:00 | record_payment | odoo.record_payment | Client B | 3000 | live |\n\
             | 09:01:00 | log_expense | odoo.record_expense | late_fee | 35 | live |\n",
        )
        .unwrap();
        fs::write(
            vault.dir(VaultState::Logs).join("2024-06-18_audit.jsonl"),
            format!("{}\n", line("notion_sync", "n/a", "success")),
        )
        .unwrap();
        fs::write(vault.dir(VaultState::Done).join("task.md"), "done").unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 20).unwrap();
        let (path, briefing) = ceo_briefing(&vault, &audit, today).unwrap();

        assert!(path.ends_with("Briefings/2024-06-20_Monday_Briefing.md"));
        assert_eq!(briefing.revenue, 5000.0);
        assert_eq!(briefing.expenses, 205.0);
        assert_eq!(briefing.target, 20_000.0);
        assert!(briefing.revenue_behind());
        assert_eq!(briefing.completed_this_week, 1);

        let tools: Vec<_> = briefing.subscriptions.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec!["Notion", "Slack"]);
        assert!(!briefing.subscriptions[0].inactive);
        assert!(briefing.subscriptions[1].inactive);
        assert!(briefing.subscriptions[1].high_cost);
        assert_eq!(briefing.redundant["Productivity"], vec!["Notion", "Slack"]);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("**Revenue MTD**: $5,000.00 (25.0% of $20,000 Target)"));
        assert!(text.contains("**Net Income**: $4,795.00"));
        assert!(text.contains("Revenue Alert"));
        assert!(text.contains("Slack shows no activity"));
        assert!(text.contains("multiple tools (Notion, Slack)"));

        let entries = AuditLogger::read_entries(&audit.today_path()).unwrap();
        assert_eq!(entries.last().unwrap().action_type, "generate_briefing");
    }

    #[test]
    fn test_ceo_briefing_defaults_without_data() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&[]).unwrap();
        let audit = AuditLogger::new(&vault, "tester");

        let today = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let (_, briefing) = ceo_briefing(&vault, &audit, today).unwrap();
        assert_eq!(briefing.target, DEFAULT_REVENUE_TARGET);
        assert_eq!(briefing.revenue, 0.0);
        assert!(!briefing.revenue_behind());
        assert!(briefing.render().contains("Nothing to flag this week"));
    }

    #[test]
    fn test_empty_summary_renders() {
        let text = AuditSummary::default().render();
        assert!(text.contains("No actions recorded"));
    }
}
