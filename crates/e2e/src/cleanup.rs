//! Test teardown
//!
//! Reversals are registered as they become necessary and run after the
//! scenario body whether it passed or not, newest first, so each one sees
//! the dashboard as it was right after its own step. Each entry carries a
//! [`Criticality`]: best-effort failures are logged and swallowed, mandatory
//! failures fail the scenario once every entry has run. A leftover
//! suppression hides alerts from every later test, so unsuppression is the
//! mandatory kind.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::driver::{BrowserDriver, WaitState};
use crate::error::{E2eError, E2eResult};
use crate::wait::{AdaptiveWaiter, ElementWait};
use crate::workflow::{open_view, DashboardLocators};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    BestEffort,
    Mandatory,
}

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, E2eResult<()>> + Send>;

struct CleanupEntry {
    name: String,
    criticality: Criticality,
    action: CleanupAction,
}

/// Stack of reversals for one scenario
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Vec<CleanupEntry>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, criticality: Criticality, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        debug!("Registered {:?} cleanup '{}'", criticality, name);
        self.entries.push(CleanupEntry {
            name: name.to_string(),
            criticality,
            action: Box::new(move || action().boxed()),
        });
    }

/// Register unless an entry with this name already exists. An existing
    /// entry keeps its action but moves to the top of the stack, so it still
    /// runs before reversals registered after its first use.
    pub fn register_once<F, Fut>(&mut self, name: &str, criticality: Criticality, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        match self.entries.iter().position(|e| e.name == name) {
            Some(idx) => {
                let entry = self.entries.remove(idx);
                debug!("Cleanup '{}' already registered, moved to top", name);
                self.entries.push(entry);
            }
            None => self.register(name, criticality, action),
        }
    }

    pub fn best_effort<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        self.register(name, Criticality::BestEffort, action);
    }

    pub fn mandatory<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        self.register(name, Criticality::Mandatory, action);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Names in registration order (the reverse of run order)
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every entry, last registered first. Never stops early; a panicking
    /// action counts as a failure of that entry.
    pub async fn run(self) -> CleanupReport {
        let mut outcomes = Vec::with_capacity(self.entries.len());

        for CleanupEntry {
            name,
            criticality,
            action,
        } in self.entries.into_iter().rev()
        {
            let start = Instant::now();
            let result = match AssertUnwindSafe(async move { action().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(E2eError::Driver(format!("cleanup '{}' panicked", name))),
            };

            let error = match result {
                Ok(()) => {
                    debug!("Cleanup '{}' done", name);
                    None
                }
                Err(e) => {
                    match criticality {
                        Criticality::BestEffort => warn!("Cleanup '{}' failed: {}", name, e),
                        Criticality::Mandatory => {
                            error!("Mandatory cleanup '{}' failed: {}", name, e)
                        }
                    }
                    Some(e.to_string())
                }
            };

            outcomes.push(CleanupOutcome {
                name,
                criticality,
                error,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        CleanupReport { outcomes }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub name: String,
    pub criticality: Criticality,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CleanupOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub outcomes: Vec<CleanupOutcome>,
}

impl CleanupReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(CleanupOutcome::succeeded)
    }

    pub fn mandatory_failures(&self) -> Vec<&CleanupOutcome> {
        self.failures(Criticality::Mandatory)
    }

    pub fn best_effort_failures(&self) -> Vec<&CleanupOutcome> {
        self.failures(Criticality::BestEffort)
    }

    fn failures(&self, criticality: Criticality) -> Vec<&CleanupOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.criticality == criticality && !o.succeeded())
            .collect()
    }

    /// `Err(CleanupFailed)` when any mandatory entry failed
    pub fn into_result(self) -> E2eResult<CleanupReport> {
        let failures: Vec<String> = self
            .mandatory_failures()
            .iter()
            .map(|o| format!("{}: {}", o.name, o.error.as_deref().unwrap_or("unknown error")))
            .collect();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(E2eError::CleanupFailed { failures })
        }
    }
}

/// What `unsuppress_all` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnsuppressReport {
    pub initial: usize,
    pub iterations: usize,
    pub remaining: usize,
}

/// Stack-aware reversal routines.
///
/// Each one waits for the view to render and its row count to settle before
/// touching it, then re-checks the result.
#[derive(Clone)]
pub struct CleanupCoordinator {
    driver: Arc<dyn BrowserDriver>,
    waiter: AdaptiveWaiter,
    locators: DashboardLocators,
    base_url: String,
    max_unsuppress_iterations: usize,
    step_timeout: Duration,
}

impl CleanupCoordinator {
    pub fn new(waiter: AdaptiveWaiter, base_url: impl Into<String>) -> Self {
        Self {
            driver: waiter.driver().clone(),
            waiter,
            locators: DashboardLocators::default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_unsuppress_iterations: 25,
            step_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_locators(mut self, locators: DashboardLocators) -> Self {
        self.locators = locators;
        self
    }

    pub fn with_max_unsuppress_iterations(mut self, ceiling: usize) -> Self {
        self.max_unsuppress_iterations = ceiling;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn locators(&self) -> &DashboardLocators {
        &self.locators
    }

    /// Remove every suppression.
    ///
    /// Stabilize the table, remove the first row until empty or the
    /// iteration ceiling is hit, then re-verify. Rows left over are an error.
    pub async fn unsuppress_all(&self) -> E2eResult<UnsuppressReport> {
        let l = &self.locators;
        let url = format!("{}{}", self.base_url, l.suppressions_path);
        open_view(
            self.driver.as_ref(),
            &self.waiter,
            &url,
            &l.suppression_table,
            self.step_timeout,
        )
        .await?;

        let initial = self.settled_count(&l.suppression_rows).await?;
        info!("{} suppressions to remove", initial);

        let mut iterations = 0;
        let mut current = initial;
        while current > 0 && iterations < self.max_unsuppress_iterations {
            iterations += 1;
            debug!("Unsuppress iteration {} ({} rows)", iterations, current);

            if let Err(e) = self.remove_first_suppression(current).await {
                warn!("Unsuppress iteration {} did not complete: {}", iterations, e);
            }
            current = self.driver.count(&l.suppression_rows).await.unwrap_or(current);
        }

        if current > 0 && iterations >= self.max_unsuppress_iterations {
            warn!(
                "Stopped unsuppressing after {} iterations with {} rows left",
                iterations, current
            );
        }

        let remaining = self.settled_count(&l.suppression_rows).await?;
        let report = UnsuppressReport {
            initial,
            iterations,
            remaining,
        };
        if remaining > 0 {
            return Err(E2eError::StepFailed {
                step: "unsuppress all".to_string(),
                reason: format!(
                    "{} suppressions remain after {} removal attempts",
                    remaining, iterations
                ),
            });
        }
        info!("Removed all suppressions in {} iterations", iterations);
        Ok(report)
    }

    /// Clear any filters on a stack
    pub async fn reset_stack_filters(&self, stack: &str) -> E2eResult<()> {
        let l = &self.locators;
        open_view(
            self.driver.as_ref(),
            &self.waiter,
            &l.stack_url(&self.base_url, stack),
            &l.stack_ready,
            self.step_timeout,
        )
        .await?;
        self.settled_count(&l.alert_rows).await?;

        if !self.driver.is_visible(&l.active_filter_chip).await? {
            debug!("No filters active on '{}'", stack);
            return Ok(());
        }

        self.driver.click(&l.clear_filters_button).await?;
        self.waiter
            .wait_for_element(
                &l.active_filter_chip,
                ElementWait::visible()
                    .with_timeout(self.step_timeout)
                    .with_state(WaitState::Hidden),
            )
            .await?;
        info!("Cleared filters on '{}'", stack);
        Ok(())
    }

    /// Delete the alert titled `title`; absent alerts are already clean
    pub async fn delete_alert(&self, title: &str) -> E2eResult<()> {
        let l = &self.locators;
        open_view(
            self.driver.as_ref(),
            &self.waiter,
            &l.stack_url(&self.base_url, "all"),
            &l.stack_ready,
            self.step_timeout,
        )
        .await?;
        self.settled_count(&l.alert_rows).await?;

        let row = l.row_by_title(title);
        if self.driver.count(&row).await? == 0 {
            debug!("Alert '{}' already gone", title);
            return Ok(());
        }

        self.waiter.wait_for_element_stable(&row, None).await;
        self.driver.hover(&row).await?;
        self.driver.click(&l.in_row(title, &l.alert_delete_button)).await?;
        self.confirm_if_asked().await?;

        self.waiter
            .wait_until(
                &format!("alert '{}' removed", title),
                self.step_timeout,
                Duration::from_millis(200),
                || async { Ok(self.driver.count(&row).await? == 0) },
            )
            .await?;
        info!("Deleted alert '{}'", title);
        Ok(())
    }

    async fn remove_first_suppression(&self, before: usize) -> E2eResult<()> {
        let l = &self.locators;
        self.driver.click(&l.suppression_remove_button).await?;
        self.confirm_if_asked().await?;
        self.waiter
            .wait_until(
                "suppression row removed",
                self.step_timeout,
                Duration::from_millis(100),
                || async { Ok(self.driver.count(&l.suppression_rows).await? < before) },
            )
            .await
    }

    async fn confirm_if_asked(&self) -> E2eResult<()> {
        let confirm = &self.locators.confirm_button;
        let asked = self
            .waiter
            .wait_for_any_visible(&[((), confirm.clone())], Duration::from_millis(500))
            .await
            .is_ok();
        if asked {
            self.driver.click(confirm).await?;
        }
        Ok(())
    }

    async fn settled_count(&self, selector: &str) -> E2eResult<usize> {
        Ok(self.waiter.wait_for_count_stable(selector, None).await?.count)
    }
}
