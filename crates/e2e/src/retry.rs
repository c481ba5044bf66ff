//! Bounded retry with exponential backoff
//!
//! Attempt 1 runs immediately; attempt `k > 1` waits `base_delay * 2^(k-2)`.
//! When the second-to-last attempt fails a best-effort diagnostic capture is
//! taken so the final failure has a screenshot of the state that preceded it.
//! Operations are not rolled back between attempts; callers pass only
//! operations that are safe to repeat.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alertwatch_common::config::RetryConfig;
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticCapture;
use crate::error::{E2eError, E2eResult};

/// How many times to try and how long to back off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A single attempt, no backoff
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before the given 1-based attempt
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Per-attempt view handed to the retried operation
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub last_error: Option<String>,
}

impl RetryContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Executes operations under a [`RetryPolicy`]
#[derive(Clone, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
    diagnostics: Option<Arc<dyn DiagnosticCapture>>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            diagnostics: None,
        }
    }

    /// Attach a diagnostic capture taken before the final attempt
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticCapture>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Same engine and diagnostics with a different policy
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            diagnostics: self.diagnostics.clone(),
        }
    }

    /// Run `op` until it succeeds or the attempts are used up
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> E2eResult<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = E2eResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<E2eError> = None;

        for attempt in 1..=max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(
                    "Backing off {} ms before attempt {}/{} of '{}'",
                    delay.as_millis(),
                    attempt,
                    max_attempts,
                    operation
                );
                tokio::time::sleep(delay).await;
            }

            let ctx = RetryContext {
                operation: operation.to_string(),
                attempt,
                max_attempts,
                base_delay: self.policy.base_delay,
                last_error: last_error.as_ref().map(|e| e.to_string()),
            };

            match op(ctx).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("'{}' succeeded on attempt {}/{}", operation, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        "'{}' attempt {}/{} failed: {}",
                        operation, attempt, max_attempts, e
                    );
                    if max_attempts > 1 && attempt == max_attempts - 1 {
                        self.capture_before_final(operation).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| {
            E2eError::Driver(format!("'{}' produced no attempts", operation))
        });
        Err(E2eError::RetryExhausted {
            operation: operation.to_string(),
            attempts: max_attempts,
            source: Box::new(source),
        })
    }

    async fn capture_before_final(&self, operation: &str) {
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        let label = format!("{}-before-final-attempt", operation);
        match diagnostics.capture(&label).await {
            Ok(path) => debug!("Captured diagnostics for '{}' at {}", operation, path.display()),
            Err(e) => warn!("Diagnostic capture for '{}' failed: {}", operation, e),
        }
    }
}

/// Retry `op` with an ad hoc policy and no diagnostics
pub async fn retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    op: F,
) -> E2eResult<T>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    RetryEngine::new(RetryPolicy::new(max_attempts, base_delay))
        .retry(operation, op)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
        assert_eq!(policy.delay_before(5), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_monotonic_and_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        let mut previous = Duration::ZERO;
        for attempt in 1..=100 {
            let delay = policy.delay_before(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_context_reports_previous_error() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let result = retry("ctx", 2, Duration::from_millis(1), |ctx| {
            seen.lock().push((ctx.attempt, ctx.last_error.clone(), ctx.is_final_attempt()));
            async move {
                if ctx.attempt == 1 {
                    Err(E2eError::Driver("first".into()))
                } else {
                    Ok(ctx.attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        let seen = seen.into_inner();
        assert_eq!(seen[0], (1, None, false));
        assert_eq!(seen[1].0, 2);
        assert!(seen[1].1.as_deref().unwrap().contains("first"));
        assert!(seen[1].2);
    }
}
