//! Error classification and exponential backoff policy.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ActionError;

/// Substrings that mark an error as an authentication/permission problem
pub const AUTH_TERMS: [&str; 7] = [
    "auth",
    "permission",
    "unauthorized",
    "login",
    "credentials",
    "401",
    "403",
];

/// Action names touching money; these never auto-retry
pub const SENSITIVE_TERMS: [&str; 5] = ["bank", "payment", "invoice", "transfer", "odoo"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network/IO hiccup, worth retrying
    Transient,
    /// Credentials or permissions; needs a human, never retried
    Auth,
    /// The input itself is unusable
    Structural,
}

pub fn is_auth_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    AUTH_TERMS.iter().any(|t| lower.contains(t))
}

pub fn is_sensitive_action(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_TERMS.iter().any(|t| lower.contains(t))
}

pub fn classify(err: &ActionError) -> ErrorClass {
    if is_auth_error(&err.to_string()) {
        return ErrorClass::Auth;
    }
    match err {
        ActionError::Failed(_) => ErrorClass::Transient,
        ActionError::Malformed(_) | ActionError::UnknownAction(_) => ErrorClass::Structural,
    }
}

/// Backoff parameters for one wrapped operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(config.base_delay_secs.max(0.0)),
            backoff_factor: config.backoff_factor.max(1.0),
            jitter: config.jitter,
        }
    }

    /// A single-attempt policy
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `failed + 1`, after `failed` failures (1-based)
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let secs = if self.jitter {
            base * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            base
        };
        Duration::from_secs_f64(secs)
    }
}

/// Injectable sleep so retry timing can be observed in tests
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps without waiting
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}
