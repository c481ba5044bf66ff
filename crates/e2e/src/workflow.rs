//! Dashboard domain actions
//!
//! [`WorkflowDriver`] turns scenario steps ("create an alert", "suppress it")
//! into driver calls. Every action is retried through the [`RetryEngine`] and
//! waits through the [`AdaptiveWaiter`]; every action that leaves state behind
//! registers its reversal in the caller's [`CleanupRegistry`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cleanup::{CleanupCoordinator, CleanupRegistry, Criticality};
use crate::driver::{BrowserDriver, WaitState};
use crate::error::{E2eError, E2eResult};
use crate::retry::RetryEngine;
use crate::wait::{AdaptiveWaiter, ElementWait};

/// Selectors and routes of the dashboard UI.
///
/// Templates use `{stack}`, `{title}`, `{field}`, `{severity}` and `{kind}`
/// placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardLocators {
    pub stack_path: String,
    pub stack_ready: String,
    pub alert_rows: String,
    pub alert_row_by_title: String,

    pub new_alert_button: String,
    pub alert_title_input: String,
    pub alert_severity_select: String,
    pub alert_severity_option: String,
    pub alert_source_input: String,
    pub alert_description_input: String,
    pub alert_save_button: String,
    pub alert_delete_button: String,
    pub confirm_button: String,

    pub filter_field_select: String,
    pub filter_field_option: String,
    pub filter_value_input: String,
    pub filter_apply_button: String,
    pub active_filter_chip: String,
    pub clear_filters_button: String,

    pub suppress_button: String,
    pub suppress_duration_input: String,
    pub suppress_reason_input: String,
    pub suppress_confirm_button: String,
    pub suppressions_path: String,
    pub suppression_table: String,
    pub suppression_rows: String,
    pub suppression_remove_button: String,

    pub dispatch_button: String,
    pub dispatch_target_input: String,
    pub dispatch_submit_button: String,
    pub success_toast: String,

    pub reports_path: String,
    pub report_kind_option: String,
    pub report_range_input: String,
    pub report_generate_button: String,
    pub report_ready: String,
}

impl Default for DashboardLocators {
    fn default() -> Self {
        Self {
            stack_path: "/stacks/{stack}".to_string(),
            stack_ready: r#"[data-testid="alert-stack"]"#.to_string(),
            alert_rows: r#"[data-testid="alert-row"]"#.to_string(),
            alert_row_by_title: r#"[data-testid="alert-row"]:has-text("{title}")"#.to_string(),

            new_alert_button: r#"[data-testid="new-alert"]"#.to_string(),
            alert_title_input: r#"[data-testid="alert-title"]"#.to_string(),
            alert_severity_select: r#"[data-testid="alert-severity"]"#.to_string(),
            alert_severity_option: r#"[data-testid="severity-option-{severity}"]"#.to_string(),
            alert_source_input: r#"[data-testid="alert-source"]"#.to_string(),
            alert_description_input: r#"[data-testid="alert-description"]"#.to_string(),
            alert_save_button: r#"[data-testid="alert-save"]"#.to_string(),
            alert_delete_button: r#"[data-testid="alert-delete"]"#.to_string(),
            confirm_button: r#"[data-testid="confirm-dialog-confirm"]"#.to_string(),

            filter_field_select: r#"[data-testid="filter-field"]"#.to_string(),
            filter_field_option: r#"[data-testid="filter-field-option-{field}"]"#.to_string(),
            filter_value_input: r#"[data-testid="filter-value"]"#.to_string(),
            filter_apply_button: r#"[data-testid="filter-apply"]"#.to_string(),
            active_filter_chip: r#"[data-testid="active-filter"]"#.to_string(),
            clear_filters_button: r#"[data-testid="filters-clear"]"#.to_string(),

            suppress_button: r#"[data-testid="alert-suppress"]"#.to_string(),
            suppress_duration_input: r#"[data-testid="suppress-duration"]"#.to_string(),
            suppress_reason_input: r#"[data-testid="suppress-reason"]"#.to_string(),
            suppress_confirm_button: r#"[data-testid="suppress-confirm"]"#.to_string(),
            suppressions_path: "/suppressions".to_string(),
            suppression_table: r#"[data-testid="suppression-table"]"#.to_string(),
            suppression_rows: r#"[data-testid="suppression-row"]"#.to_string(),
            suppression_remove_button: r#"[data-testid="suppression-row"] [data-testid="suppression-remove"]"#.to_string(),

            dispatch_button: r#"[data-testid="alert-dispatch"]"#.to_string(),
            dispatch_target_input: r#"[data-testid="dispatch-target"]"#.to_string(),
            dispatch_submit_button: r#"[data-testid="dispatch-submit"]"#.to_string(),
            success_toast: r#"[data-testid="toast-success"]"#.to_string(),

            reports_path: "/reports".to_string(),
            report_kind_option: r#"[data-testid="report-kind-{kind}"]"#.to_string(),
            report_range_input: r#"[data-testid="report-range"]"#.to_string(),
            report_generate_button: r#"[data-testid="report-generate"]"#.to_string(),
            report_ready: r#"[data-testid="report-ready"]"#.to_string(),
        }
    }
}

impl DashboardLocators {
    pub fn stack_url(&self, base_url: &str, stack: &str) -> String {
        format!("{}{}", base_url, self.stack_path.replace("{stack}", stack))
    }

    pub fn row_by_title(&self, title: &str) -> String {
        self.alert_row_by_title.replace("{title}", title)
    }

    /// A control inside the row for `title`
    pub fn in_row(&self, title: &str, control: &str) -> String {
        format!("{} {}", self.row_by_title(title), control)
    }

    pub fn severity_option(&self, severity: Severity) -> String {
        self.alert_severity_option.replace("{severity}", severity.as_str())
    }

    pub fn field_option(&self, field: &str) -> String {
        self.filter_field_option.replace("{field}", field)
    }

    pub fn report_kind(&self, kind: &str) -> String {
        self.report_kind_option.replace("{kind}", kind)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    #[default]
    Minor,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub title: String,
    #[serde(default)]
    pub severity: Severity,
    pub source: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionRule {
    pub alert_title: String,
    #[serde(default = "default_suppression_minutes")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_suppression_minutes() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub alert_title: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub kind: String,
    #[serde(default)]
    pub range: Option<String>,
}

/// Timeouts for actions whose completion is slower than an element wait
#[derive(Debug, Clone, Copy)]
pub struct WorkflowTimeouts {
    pub element: Duration,
    pub report: Duration,
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self {
            element: Duration::from_secs(10),
            report: Duration::from_secs(60),
        }
    }
}

/// Navigate to `url` and wait for `ready` to show
pub(crate) async fn open_view(
    driver: &dyn BrowserDriver,
    waiter: &AdaptiveWaiter,
    url: &str,
    ready: &str,
    timeout: Duration,
) -> E2eResult<()> {
    debug!("Opening {}", url);
    driver.goto(url).await?;
    waiter
        .wait_for_element(ready, ElementWait::visible().with_timeout(timeout))
        .await?;
    Ok(())
}

pub struct WorkflowDriver {
    driver: Arc<dyn BrowserDriver>,
    waiter: AdaptiveWaiter,
    retry: RetryEngine,
    cleanup: CleanupCoordinator,
    locators: DashboardLocators,
    timeouts: WorkflowTimeouts,
    base_url: String,
    default_stack: String,
}

impl WorkflowDriver {
    pub fn new(
        waiter: AdaptiveWaiter,
        retry: RetryEngine,
        cleanup: CleanupCoordinator,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            driver: waiter.driver().clone(),
            locators: cleanup.locators().clone(),
            waiter,
            retry,
            cleanup,
            timeouts: WorkflowTimeouts::default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_stack: "all".to_string(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: WorkflowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Stack that new alerts are created from
    pub fn with_default_stack(mut self, stack: impl Into<String>) -> Self {
        self.default_stack = stack.into();
        self
    }

    pub fn locators(&self) -> &DashboardLocators {
        &self.locators
    }

    pub fn waiter(&self) -> &AdaptiveWaiter {
        &self.waiter
    }

    /// Open a stack and return its row count once the count has settled
    pub async fn open_stack(&self, stack: &str) -> E2eResult<usize> {
        self.retry
            .retry(&format!("open-stack-{}", stack), |_ctx| async move {
                self.navigate_stack(stack).await?;
                self.stack_row_count().await
            })
            .await
    }

    /// Row count of the stack currently shown, after it stops changing
    pub async fn stack_row_count(&self) -> E2eResult<usize> {
        let report = self
            .waiter
            .wait_for_count_stable(&self.locators.alert_rows, None)
            .await?;
        if !report.stable {
            debug!("Row count still moving after {:?}; using {}", report.elapsed, report.count);
        }
        Ok(report.count)
    }

    pub async fn create_alert(
        &self,
        draft: &AlertDraft,
        registry: &mut CleanupRegistry,
    ) -> E2eResult<()> {
        let l = &self.locators;
        let row = l.row_by_title(&draft.title);

        self.retry
            .retry(&format!("create-alert-{}", draft.title), |ctx| {
                let row = row.clone();
                async move {
                    self.navigate_stack(&self.default_stack).await?;
                    if ctx.attempt > 1 && self.driver.count(&row).await? > 0 {
                        info!("Alert '{}' exists from an earlier attempt", draft.title);
                        return Ok(());
                    }

                    self.driver.click(&l.new_alert_button).await?;
                    self.waiter
                        .wait_for_element(&l.alert_title_input, self.element_wait())
                        .await?;
                    self.driver.fill(&l.alert_title_input, &draft.title).await?;
                    self.driver.click(&l.alert_severity_select).await?;
                    self.driver.click(&l.severity_option(draft.severity)).await?;
                    self.driver.fill(&l.alert_source_input, &draft.source).await?;
                    if let Some(description) = &draft.description {
                        self.driver.fill(&l.alert_description_input, description).await?;
                    }
                    self.driver.click(&l.alert_save_button).await?;

                    self.waiter
                        .wait_for_element(&row, self.element_wait())
                        .await?;
                    Ok(())
                }
            })
            .await?;

        info!("Created alert '{}'", draft.title);
        let cleanup = self.cleanup.clone();
        let title = draft.title.clone();
        registry.register_once(
            &format!("delete alert '{}'", draft.title),
            Criticality::BestEffort,
            move || async move { cleanup.delete_alert(&title).await },
        );
        Ok(())
    }

    /// Apply a filter to a stack; returns the settled row count
    pub async fn apply_filter(
        &self,
        stack: &str,
        filter: &FilterSpec,
        registry: &mut CleanupRegistry,
    ) -> E2eResult<usize> {
        let l = &self.locators;

        let count = self
            .retry
            .retry(&format!("apply-filter-{}-{}", stack, filter.field), |_ctx| async move {
                self.navigate_stack(stack).await?;
                self.driver.click(&l.filter_field_select).await?;
                self.driver.click(&l.field_option(&filter.field)).await?;
                self.driver.fill(&l.filter_value_input, &filter.value).await?;
                self.driver.click(&l.filter_apply_button).await?;
                self.waiter
                    .wait_for_element(&l.active_filter_chip, self.element_wait())
                    .await?;
                self.stack_row_count().await
            })
            .await?;

        info!("Filter {}={} on '{}' shows {} rows", filter.field, filter.value, stack, count);
        let cleanup = self.cleanup.clone();
        let stack_name = stack.to_string();
        registry.register_once(
            &format!("reset filters on '{}'", stack),
            Criticality::BestEffort,
            move || async move { cleanup.reset_stack_filters(&stack_name).await },
        );
        Ok(count)
    }

    /// Suppress an alert. Registers a mandatory unsuppress for teardown.
    pub async fn suppress(
        &self,
        rule: &SuppressionRule,
        registry: &mut CleanupRegistry,
    ) -> E2eResult<()> {
        let l = &self.locators;
        let row = l.row_by_title(&rule.alert_title);

        // Registered before acting so a half-applied suppression is still removed
        let cleanup = self.cleanup.clone();
        registry.register_once(
            "unsuppress all",
            Criticality::Mandatory,
            move || async move { cleanup.unsuppress_all().await.map(|_| ()) },
        );

        self.retry
            .retry(&format!("suppress-{}", rule.alert_title), |_ctx| {
                let row = row.clone();
                async move {
                    self.navigate_stack(&self.default_stack).await?;
                    if self.driver.count(&row).await? == 0 {
                        return Err(E2eError::StepFailed {
                            step: "suppress".to_string(),
                            reason: format!("no alert row titled '{}'", rule.alert_title),
                        });
                    }
                    self.waiter.wait_for_element_stable(&row, None).await;
                    self.driver.hover(&row).await?;
                    self.driver
                        .click(&l.in_row(&rule.alert_title, &l.suppress_button))
                        .await?;
                    self.waiter
                        .wait_for_element(&l.suppress_duration_input, self.element_wait())
                        .await?;
                    self.driver
                        .fill(&l.suppress_duration_input, &rule.duration_minutes.to_string())
                        .await?;
                    if let Some(reason) = &rule.reason {
                        self.driver.fill(&l.suppress_reason_input, reason).await?;
                    }
                    self.driver.click(&l.suppress_confirm_button).await?;

                    self.waiter
                        .wait_for_element(&row, self.element_wait().with_state(WaitState::Detached))
                        .await?;
                    Ok(())
                }
            })
            .await?;

        info!("Suppressed '{}' for {} min", rule.alert_title, rule.duration_minutes);
        Ok(())
    }

    /// Dispatch an alert to a target. Leaves nothing to clean up.
    pub async fn dispatch(&self, request: &DispatchRequest) -> E2eResult<()> {
        let l = &self.locators;
        self.retry
            .retry(&format!("dispatch-{}", request.alert_title), |_ctx| async move {
                self.navigate_stack(&self.default_stack).await?;
                self.waiter
                    .wait_for_element(&l.row_by_title(&request.alert_title), self.element_wait())
                    .await?;
                self.driver
                    .click(&l.in_row(&request.alert_title, &l.dispatch_button))
                    .await?;
                self.waiter
                    .wait_for_element(&l.dispatch_target_input, self.element_wait())
                    .await?;
                self.driver.fill(&l.dispatch_target_input, &request.target).await?;
                self.driver.click(&l.dispatch_submit_button).await?;
                self.waiter
                    .wait_for_element(&l.success_toast, self.element_wait())
                    .await?;
                Ok(())
            })
            .await?;

        info!("Dispatched '{}' to {}", request.alert_title, request.target);
        Ok(())
    }

    pub async fn generate_report(&self, request: &ReportRequest) -> E2eResult<()> {
        let l = &self.locators;
        let url = format!("{}{}", self.base_url, l.reports_path);

        self.retry
            .retry(&format!("report-{}", request.kind), |_ctx| {
                let url = url.clone();
                async move {
                    open_view(
                        self.driver.as_ref(),
                        &self.waiter,
                        &url,
                        &l.report_generate_button,
                        self.timeouts.element,
                    )
                    .await?;
                    self.driver.click(&l.report_kind(&request.kind)).await?;
                    if let Some(range) = &request.range {
                        self.driver.fill(&l.report_range_input, range).await?;
                    }
                    self.driver.click(&l.report_generate_button).await?;
                    self.waiter
                        .wait_for_element(
                            &l.report_ready,
                            ElementWait::visible().with_timeout(self.timeouts.report),
                        )
                        .await?;
                    Ok(())
                }
            })
            .await?;

        info!("Generated '{}' report", request.kind);
        Ok(())
    }

    async fn navigate_stack(&self, stack: &str) -> E2eResult<()> {
        open_view(
            self.driver.as_ref(),
            &self.waiter,
            &self.locators.stack_url(&self.base_url, stack),
            &self.locators.stack_ready,
            self.timeouts.element,
        )
        .await
    }

    fn element_wait(&self) -> ElementWait {
        ElementWait::visible().with_timeout(self.timeouts.element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_templates() {
        let l = DashboardLocators::default();
        assert_eq!(
            l.stack_url("http://dash.local", "critical"),
            "http://dash.local/stacks/critical"
        );
        assert_eq!(
            l.in_row("CPU high", &l.suppress_button),
            r#"[data-testid="alert-row"]:has-text("CPU high") [data-testid="alert-suppress"]"#
        );
        assert_eq!(
            l.severity_option(Severity::Critical),
            r#"[data-testid="severity-option-critical"]"#
        );
    }

    #[test]
    fn test_suppression_rule_defaults() {
        let rule: SuppressionRule = serde_yaml::from_str("alert_title: Disk full").unwrap();
        assert_eq!(rule.duration_minutes, 60);
        assert!(rule.reason.is_none());
    }
}
