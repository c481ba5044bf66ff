//! Sequential scenario runner
//!
//! One browser, one worker, scenarios in declaration order. Alerts,
//! suppressions and sessions on the target are shared, so two scenarios
//! running at once would corrupt each other's fixtures.
//!
//! Per scenario: ensure identity → select tenant → run steps → run cleanup
//! (always) → record the result. A failed mandatory cleanup fails the
//! scenario even when every step passed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alertwatch_common::{HarnessConfig, IdentityConfig, SessionStore, UserType};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth::AuthOrchestrator;
use crate::cleanup::{CleanupCoordinator, CleanupRegistry, CleanupReport};
use crate::diagnostics::{DiagnosticCapture, DiagnosticSink};
use crate::driver::BrowserDriver;
use crate::error::{E2eError, E2eResult};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::spec::{TestSpec, TestStep};
use crate::visual::{ScheduledComparison, VisualTester};
use crate::wait::AdaptiveWaiter;
use crate::workflow::WorkflowDriver;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub user: UserType,
    pub success: bool,
    pub duration_ms: u64,
    /// How the identity was reached (`AlreadyAuthenticated`, `RestoredSession`, `LoggedIn`)
    pub auth: Option<String>,
    pub steps: Vec<StepResult>,
    pub visual: Vec<ScheduledComparison>,
    pub cleanup: CleanupReport,
    pub error: Option<String>,
}

/// Result of running all scenarios
#[derive(Debug, Clone, Serialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub login_submits: u32,
    pub logout_attempts: u32,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub harness: HarnessConfig,
    pub identities: IdentityConfig,
    pub specs_dir: PathBuf,
    pub tag: Option<String>,
    /// Substring match on scenario names
    pub name: Option<String>,
    pub fresh_sessions: bool,
    pub update_baselines: bool,
}

/// Check the target answers HTTP at all before launching a browser.
///
/// Any response below 500 counts as reachable; the entry page usually
/// redirects to the identity provider.
pub async fn preflight(base_url: &str) -> E2eResult<()> {
    let client = reqwest::Client::builder()
        .timeout(PREFLIGHT_TIMEOUT)
        .build()?;
    let response = client
        .get(base_url)
        .send()
        .await
        .map_err(|e| E2eError::Preflight(format!("{} is unreachable: {}", base_url, e)))?;

    let status = response.status();
    if status.is_server_error() {
        return Err(E2eError::Preflight(format!("{} answered {}", base_url, status)));
    }
    debug!("Preflight {} -> {}", base_url, status);
    Ok(())
}

/// Main E2E test runner
pub struct TestRunner {
    config: RunnerConfig,
    driver: Arc<dyn BrowserDriver>,
    waiter: AdaptiveWaiter,
    diagnostics: Arc<dyn DiagnosticCapture>,
    auth: AuthOrchestrator,
    workflow: WorkflowDriver,
    visual: VisualTester,
}

impl TestRunner {
    /// Wire the harness components around `driver`
    pub fn new(config: RunnerConfig, driver: Arc<dyn BrowserDriver>) -> E2eResult<Self> {
        let h = &config.harness;
        h.validate()?;
        let base_url = h.base_url().to_string();

        let sessions = SessionStore::with_config(&h.session);
        if config.fresh_sessions {
            info!("Discarding stored sessions in {}", sessions.dir().display());
            sessions.clear_all()?;
        }

        let waiter = AdaptiveWaiter::new(driver.clone(), &h.waits);
        let diagnostics: Arc<dyn DiagnosticCapture> =
            Arc::new(DiagnosticSink::new(driver.clone(), &h.output.debug_dir));
        let retry = RetryEngine::new(RetryPolicy::from(&h.retry)).with_diagnostics(diagnostics.clone());

        let auth = AuthOrchestrator::new(driver.clone(), waiter.clone(), sessions, base_url.clone())
            .with_diagnostics(diagnostics.clone())
            .with_tenant(h.site.tenant.clone());
        let cleanup = CleanupCoordinator::new(waiter.clone(), base_url.clone())
            .with_max_unsuppress_iterations(h.cleanup.max_unsuppress_iterations as usize)
            .with_step_timeout(Duration::from_millis(h.waits.element_timeout_ms));
        let workflow = WorkflowDriver::new(waiter.clone(), retry, cleanup, base_url);
        let visual = VisualTester::new(&h.visual, &h.output.results_dir, config.update_baselines)?;

        Ok(Self {
            config,
            driver,
            waiter,
            diagnostics,
            auth,
            workflow,
            visual,
        })
    }

    /// Load scenarios from the specs directory and apply the tag/name filters
    pub fn select_specs(&self) -> E2eResult<Vec<TestSpec>> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        let selected: Vec<TestSpec> = specs
            .into_iter()
            .filter(|s| self.config.tag.as_deref().map_or(true, |t| s.has_tag(t)))
            .filter(|s| self.config.name.as_deref().map_or(true, |n| s.name.contains(n)))
            .collect();
        Ok(selected)
    }

    pub async fn run_all(&mut self) -> E2eResult<TestSuiteResult> {
        let specs = self.select_specs()?;
        if specs.is_empty() {
            warn!("No scenarios matched in {}", self.config.specs_dir.display());
        }
        Ok(self.run_specs(&specs).await)
    }

    /// Run scenarios one after another in the given order
    pub async fn run_specs(&mut self, specs: &[TestSpec]) -> TestSuiteResult {
        let start = Instant::now();
        let mut results = Vec::with_capacity(specs.len());

        info!("Running {} scenario(s) sequentially", specs.len());
        for spec in specs {
            let result = self.run_spec(spec).await;
            if result.success {
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                error!(
                    "✗ {} - {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        let passed = results.iter().filter(|r| r.success).count();
        let suite = TestSuiteResult {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            duration_ms: start.elapsed().as_millis() as u64,
            login_submits: self.auth.login_submits(),
            logout_attempts: self.auth.logout_attempts(),
            results,
        };
        info!(
            "Results: {} passed, {} failed ({} ms, {} logins)",
            suite.passed, suite.failed, suite.duration_ms, suite.login_submits
        );
        suite
    }

    /// Run one scenario. Cleanup runs whatever happened before it.
    pub async fn run_spec(&mut self, spec: &TestSpec) -> TestResult {
        let start = Instant::now();
        info!("▶ {} (as {})", spec.name, spec.user);

        let mut registry = CleanupRegistry::new();
        let mut steps = Vec::new();
        let mut visual = Vec::new();
        let mut auth_outcome = None;

        let body = self
            .run_body(spec, &mut registry, &mut steps, &mut visual, &mut auth_outcome)
            .await;
        if let Err(e) = &body {
            let label = format!("{}-failure", spec.name);
            if let Err(capture_err) = self.diagnostics.capture(&label).await {
                warn!("Diagnostic capture for '{}' failed: {}", spec.name, capture_err);
            }
            debug!("Scenario body failed: {}", e);
        }

        debug!("Running {} cleanup action(s) for '{}'", registry.len(), spec.name);
        let cleanup = registry.run().await;
        let cleanup_error = cleanup.clone().into_result().err();

        let error = match (body, cleanup_error) {
            (Err(e), Some(c)) => Some(format!("{}; {}", e, c)),
            (Err(e), None) => Some(e.to_string()),
            (Ok(()), Some(c)) => Some(c.to_string()),
            (Ok(()), None) => None,
        };

        TestResult {
            name: spec.name.clone(),
            user: spec.user,
            success: error.is_none(),
            duration_ms: start.elapsed().as_millis() as u64,
            auth: auth_outcome,
            steps,
            visual,
            cleanup,
            error,
        }
    }

    async fn run_body(
        &mut self,
        spec: &TestSpec,
        registry: &mut CleanupRegistry,
        steps: &mut Vec<StepResult>,
        visual: &mut Vec<ScheduledComparison>,
        auth_outcome: &mut Option<String>,
    ) -> E2eResult<()> {
        let credentials = self.config.identities.credentials(spec.user).clone();
        let outcome = self.auth.ensure(spec.user, &credentials).await?;
        *auth_outcome = Some(format!("{:?}", outcome));

        if let Some(tenant) = &spec.tenant {
            self.auth.ensure_tenant(tenant).await?;
        }

        for step in &spec.steps {
            let started = Instant::now();
            let label = step.label();
            debug!("Step {}", label);

            let result = self.execute_step(step, registry, visual).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(()) => steps.push(StepResult {
                    step: label,
                    success: true,
                    duration_ms,
                    error: None,
                }),
                Err(e) => {
                    steps.push(StepResult {
                        step: label,
                        success: false,
                        duration_ms,
                        error: Some(e.to_string()),
                    });
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        step: &TestStep,
        registry: &mut CleanupRegistry,
        visual: &mut Vec<ScheduledComparison>,
    ) -> E2eResult<()> {
        match step {
            TestStep::OpenStack { stack } => {
                let rows = self.workflow.open_stack(stack).await?;
                debug!("Stack '{}' has {} rows", stack, rows);
            }
            TestStep::CreateAlert(draft) => self.workflow.create_alert(draft, registry).await?,
            TestStep::ApplyFilter { stack, filter } => {
                self.workflow.apply_filter(stack, filter, registry).await?;
            }
            TestStep::Suppress(rule) => self.workflow.suppress(rule, registry).await?,
            TestStep::Dispatch(request) => self.workflow.dispatch(request).await?,
            TestStep::GenerateReport(request) => self.workflow.generate_report(request).await?,
            TestStep::ExpectCount {
                stack,
                equals,
                at_least,
            } => {
                let count = match stack {
                    Some(stack) => self.workflow.open_stack(stack).await?,
                    None => self.workflow.stack_row_count().await?,
                };
                check_count(count, *equals, *at_least)?;
            }
            TestStep::WaitStable { selector } => {
                let report = self.waiter.wait_for_element_stable(selector, None).await;
                debug!("'{}' stable={} after {} samples", selector, report.stable, report.samples_taken);
            }
            TestStep::Screenshot { name, compare } => {
                if *compare && !self.config.update_baselines {
                    visual.push(self.visual.compare_with_schedule(self.driver.as_ref(), name).await?);
                } else {
                    self.driver.screenshot(&self.visual.actual_path(name)).await?;
                    if self.config.update_baselines {
                        self.visual.update_baseline(name)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Write results to `<results_dir>/test-results.json`
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        let dir = &self.config.harness.output.results_dir;
        std::fs::create_dir_all(dir)?;

        let path = dir.join("test-results.json");
        std::fs::write(&path, serde_json::to_string_pretty(results)?)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

fn check_count(count: usize, equals: Option<usize>, at_least: Option<usize>) -> E2eResult<()> {
    if let Some(expected) = equals {
        if count != expected {
            return Err(E2eError::StepFailed {
                step: "expect_count".to_string(),
                reason: format!("expected {} rows, found {}", expected, count),
            });
        }
    }
    if let Some(minimum) = at_least {
        if count < minimum {
            return Err(E2eError::StepFailed {
                step: "expect_count".to_string(),
                reason: format!("expected at least {} rows, found {}", minimum, count),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_count() {
        assert!(check_count(3, Some(3), None).is_ok());
        assert!(check_count(3, None, Some(2)).is_ok());
        assert!(check_count(3, Some(2), None).is_err());
        let err = check_count(1, None, Some(2)).unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[tokio::test]
    async fn test_preflight_unreachable() {
        // Port 9 (discard) on localhost is closed in test environments
        let err = preflight("http://127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, E2eError::Preflight(_)));
    }
}
