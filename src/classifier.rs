//! Intent classification of incoming task text.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ActionError;

/// Result of classifying one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub domain: String,
    /// Suggested first action
    pub action: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: Map<String, Value>,
}

impl Classification {
    pub fn unknown(entities: Map<String, Value>) -> Self {
        Self {
            intent: "unknown".to_string(),
            domain: "general".to_string(),
            action: "review".to_string(),
            confidence: 0.0,
            entities,
        }
    }

    pub fn entity_str(&self, key: &str) -> Option<&str> {
        self.entities.get(key).and_then(Value::as_str)
    }

    pub fn entity_f64(&self, key: &str) -> Option<f64> {
        self.entities.get(key).and_then(Value::as_f64)
    }
}

/// Text to intent. Implementations may call out to a model.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ActionError>;
}

struct IntentRule {
    intent: &'static str,
    domain: &'static str,
    action: &'static str,
    patterns: Vec<Regex>,
}

const RULES: [(&str, &str, &str, &[&str]); 4] = [
    (
        "invoice_request",
        "finance",
        "generate_invoice",
        &[r"invoice", r"\bbill\b", r"payment.*details", r"how.*pay"],
    ),
    (
        "late_fee_notice",
        "finance",
        "log_expense",
        &[r"late.*fee", r"overdue", r"penalty", r"insufficient.*funds"],
    ),
    (
        "payment_received",
        "finance",
        "record_payment",
        &[r"payment.*received", r"transfer.*complete", r"\bpaid\b"],
    ),
    (
        "meeting_request",
        "communication",
        "schedule_meeting",
        &[r"schedule", r"\bmeet", r"calendar", r"availability"],
    ),
];

/// Explicit instructions embedded in a task ("send an email to ...")
struct Directives {
    email: Regex,
    subject: Regex,
    body: Regex,
    odoo: Regex,
    client_id: Regex,
    amount_field: Regex,
    social: Regex,
    tweet: Regex,
    content: Regex,
}

/// Regex keyword classifier with simple entity extraction.
///
/// Explicit directives win over keyword intents; the first keyword rule that
/// matches decides the intent otherwise.
pub struct KeywordClassifier {
    rules: Vec<IntentRule>,
    directives: Directives,
    dollar_amount: Regex,
    bare_amount: Regex,
    client: Regex,
}

impl KeywordClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(RULES.len());
        for (intent, domain, action, patterns) in RULES {
            rules.push(IntentRule {
                intent,
                domain,
                action,
                patterns: patterns
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<_, _>>()?,
            });
        }

        Ok(Self {
            rules,
            directives: Directives {
                email: Regex::new(r"(?i)send an email to ([\w.+-]+@[\w.-]+\w)")?,
                subject: Regex::new(r"(?im)^\s*subject:\s*(.+?)\s*$")?,
                body: Regex::new(r"(?is)\bbody:\s*(.+?)\s*$")?,
                odoo: Regex::new(r"(?i)create an odoo invoice")?,
                client_id: Regex::new(r"(?i)client id:\s*(\d+)")?,
                amount_field: Regex::new(r"(?i)amount:\s*\$?([\d.]+)")?,
                social: Regex::new(
                    r"(?i)post (?:the following )?(?:on|to) (linkedin|facebook|instagram|x)\b",
                )?,
                tweet: Regex::new(r"(?i)\btweet\b")?,
                content: Regex::new(r"(?is)\bcontent:\s*(.+?)\s*$")?,
            },
            dollar_amount: Regex::new(r"\$\s?((?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?)")?,
            bare_amount: Regex::new(r"\b((?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?)\b")?,
            client: Regex::new(r"\bClient\s+([A-Z0-9][\w&.-]*)")?,
        })
    }

    /// Classify synchronously
    pub fn classify_text(&self, text: &str) -> Classification {
        if let Some(direct) = self.directive(text) {
            return direct;
        }

        let entities = self.entities(text);
        let lower = text.to_lowercase();
        for rule in &self.rules {
            if rule.patterns.iter().any(|p| p.is_match(&lower)) {
                return Classification {
                    intent: rule.intent.to_string(),
                    domain: rule.domain.to_string(),
                    action: rule.action.to_string(),
                    confidence: 0.9,
                    entities,
                };
            }
        }
        Classification::unknown(entities)
    }

    fn entities(&self, text: &str) -> Map<String, Value> {
        let mut entities = Map::new();
        let amount = self
            .dollar_amount
            .captures(text)
            .or_else(|| self.bare_amount.captures(text))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok());
        if let Some(amount) = amount {
            entities.insert("amount".into(), json!(amount));
        }
        if let Some(c) = self.client.captures(text).and_then(|c| c.get(1)) {
            entities.insert("client".into(), json!(format!("Client {}", c.as_str())));
        }
        entities
    }

    fn directive(&self, text: &str) -> Option<Classification> {
        let d = &self.directives;
        let capture = |re: &Regex| {
            re.captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        };

        if let Some(to) = capture(&d.email) {
            let subject = capture(&d.subject)?;
            let body = capture(&d.body)?;
            return Some(direct(
                "email_request",
                "communication",
                "send_email",
                json!({"to": to, "subject": subject, "body": body}),
            ));
        }

        if d.odoo.is_match(text) {
            let client_id = capture(&d.client_id)?;
            let amount = capture(&d.amount_field)?.parse::<f64>().ok()?;
            return Some(direct(
                "odoo_invoice_request",
                "finance",
                "create_odoo_invoice",
                json!({"client_id": client_id, "amount": amount}),
            ));
        }

        let platform = match d.social.captures(text).and_then(|c| c.get(1)) {
            Some(m) => Some(m.as_str().to_lowercase()),
            None if d.tweet.is_match(text) => Some("x".to_string()),
            None => None,
        };
        if let Some(platform) = platform {
            let content = capture(&d.content)?;
            return Some(direct(
                "social_post",
                "social",
                &format!("post_{}", platform),
                json!({"content": content}),
            ));
        }
        None
    }
}

fn direct(intent: &str, domain: &str, action: &str, entities: Value) -> Classification {
    Classification {
        intent: intent.to_string(),
        domain: domain.to_string(),
        action: action.to_string(),
        confidence: 1.0,
        entities: match entities {
            Value::Object(map) => map,
            _ => Map::new(),
        },
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ActionError> {
        Ok(self.classify_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> KeywordClassifier {
        KeywordClassifier::new().unwrap()
    }

    #[test]
    fn test_invoice_with_entities() {
        let c = classifier().classify_text("Please send a $1500 invoice for Client A");
        assert_eq!(c.intent, "invoice_request");
        assert_eq!(c.domain, "finance");
        assert_eq!(c.entity_f64("amount"), Some(1500.0));
        assert_eq!(c.entity_str("client"), Some("Client A"));
    }

    #[test]
    fn test_late_fee() {
        let c = classifier().classify_text("Bank notice: $35 overdue late fee charged");
        assert_eq!(c.intent, "late_fee_notice");
        assert_eq!(c.action, "log_expense");
        assert_eq!(c.entity_f64("amount"), Some(35.0));
    }

    #[test]
    fn test_amount_with_separators() {
        let c = classifier().classify_text("Invoice total $12,450.50 due Friday");
        assert_eq!(c.entity_f64("amount"), Some(12450.5));
    }

    #[test]
    fn test_meeting_and_unknown() {
        let k = classifier();
        assert_eq!(k.classify_text("Can we schedule a call?").intent, "meeting_request");
        let unknown = k.classify_text("Lovely weather today");
        assert_eq!(unknown.intent, "unknown");
        assert_eq!(unknown.action, "review");
        assert_eq!(unknown.confidence, 0.0);
    }

    #[test]
    fn test_email_directive() {
        let text = "Please send an email to jane@example.com\nSubject: Quarterly report\nBody: Hi Jane,\nattached.";
        let c = classifier().classify_text(text);
        assert_eq!(c.intent, "email_request");
        assert_eq!(c.action, "send_email");
        assert_eq!(c.entity_str("to"), Some("jane@example.com"));
        assert_eq!(c.entity_str("subject"), Some("Quarterly report"));
        assert_eq!(c.entity_str("body"), Some("Hi Jane,\nattached."));
    }

    #[test]
    fn test_incomplete_directive_falls_back() {
        let c = classifier().classify_text("send an email to jane@example.com about the invoice");
        assert_eq!(c.intent, "invoice_request");
    }

    #[test]
    fn test_odoo_and_social_directives() {
        let k = classifier();
        let odoo = k.classify_text("Create an Odoo invoice\nClient ID: 42\nAmount: 250.00");
        assert_eq!(odoo.action, "create_odoo_invoice");
        assert_eq!(odoo.entity_str("client_id"), Some("42"));
        assert_eq!(odoo.entity_f64("amount"), Some(250.0));

        let post = k.classify_text("Post to Facebook\nContent: We are hiring!");
        assert_eq!(post.action, "post_facebook");
        assert_eq!(post.entity_str("content"), Some("We are hiring!"));

        let tweet = k.classify_text("Tweet this. Content: launch day");
        assert_eq!(tweet.action, "post_x");
    }

    #[tokio::test]
    async fn test_trait_object() {
        let k: Box<dyn Classifier> = Box::new(classifier());
        let c = k.classify("payment received, thanks").await.unwrap();
        assert_eq!(c.intent, "payment_received");
    }
}
