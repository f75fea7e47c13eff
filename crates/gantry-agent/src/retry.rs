//! Bounded retry of material updates.

use crate::cancel::CancellationToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_DELAY_MS: u64 = 5_000;

/// Retry settings as they appear in agent configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// `on_failure(attempt, attempts, &error)` is called after every failed
    /// attempt, including the last. The wait between attempts ends early on
    /// cancellation, returning the last error.
    pub async fn run<T, E, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_failure: N,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(u32, u32, &E),
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    debug!(attempt, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    on_failure(attempt, self.attempts, &e);
                    if attempt >= self.attempts {
                        warn!(attempts = self.attempts, error = %e, "Giving up after all attempts");
                        return Err(e);
                    }
                    warn!(attempt, attempts = self.attempts, error = %e, "Attempt failed, will retry");

                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => return Err(e),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        RetryPolicy::new(settings.attempts, Duration::from_millis(settings.delay_ms))
    }
}

/// Console line for a failed update attempt.
pub fn attempt_failed_message(material: &str, attempt: u32, attempts: u32, cause: &dyn Display) -> String {
    format!(
        "[gantry] Material update of {} failed on attempt {} of {}: {}",
        material, attempt, attempts, cause
    )
}

/// Retry policies keyed by material type, with a fallback.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_type: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_type: HashMap::new(),
        }
    }

    pub fn with(mut self, material_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.by_type.insert(material_type.into(), policy);
        self
    }

    /// Policy for anything without a material type of its own.
    pub fn default_policy(&self) -> RetryPolicy {
        self.default
    }

    pub fn policy_for(&self, material_type: &str) -> RetryPolicy {
        self.by_type.get(material_type).copied().unwrap_or(self.default)
    }
}
