//! Login/logout orchestration
//!
//! [`AuthOrchestrator`] reconciles "who is signed in" with "who the next test
//! needs". It owns the last-known user type for one test run, so the same
//! identity requested twice costs one visibility check instead of a login.
//!
//! ```text
//!   Unknown ──login──▶ Authenticated(a) ──ensure(b)──▶ LoggingOut ──▶ Authenticated(b)
//!      │                                                    │
//!      └──────────────login error──────────▶ LoginFailed ◀──┘
//! ```
//!
//! Logout failures are absorbed: every logout branch ends with a forced
//! navigation to the base URL so the run never gets stuck. Login failures
//! are fatal and propagate after a diagnostic capture.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alertwatch_common::{Credentials, SessionStore, StorageState, UserType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::diagnostics::DiagnosticCapture;
use crate::driver::{BrowserDriver, LoadState};
use crate::error::{E2eError, E2eResult};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::wait::{AdaptiveWaiter, ElementWait};

/// Selectors for the sign-in, sign-out and tenant UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthLocators {
    pub login_form: String,
    pub username_input: String,
    /// Two-step identity providers ask for the username first
    pub next_button: Option<String>,
    pub password_input: String,
    pub submit_button: String,
    /// Shown by the identity provider when credentials are rejected
    pub login_error: String,
    /// Any one of these visible means "signed in"
    pub authenticated_indicators: Vec<String>,
    pub user_menu: String,
    pub logout_item: String,
    pub account_picker: String,
    pub account_picker_tile: String,
    pub signed_out_marker: String,
    pub tenant_label: String,
    pub tenant_switcher: String,
    /// `{name}` is replaced by the tenant name
    pub tenant_option: String,
}

impl Default for AuthLocators {
    fn default() -> Self {
        Self {
            login_form: r#"[data-testid="login-form"]"#.to_string(),
            username_input: r#"[data-testid="login-username"]"#.to_string(),
            next_button: None,
            password_input: r#"[data-testid="login-password"]"#.to_string(),
            submit_button: r#"[data-testid="login-submit"]"#.to_string(),
            login_error: r#"[data-testid="login-error"]"#.to_string(),
            authenticated_indicators: vec![
                r#"[data-testid="user-menu"]"#.to_string(),
                r#"[data-testid="app-shell"]"#.to_string(),
            ],
            user_menu: r#"[data-testid="user-menu"]"#.to_string(),
            logout_item: r#"[data-testid="logout"]"#.to_string(),
            account_picker: r#"[data-testid="account-picker"]"#.to_string(),
            account_picker_tile: r#"[data-testid="account-tile"]"#.to_string(),
            signed_out_marker: r#"[data-testid="signed-out"]"#.to_string(),
            tenant_label: r#"[data-testid="tenant-name"]"#.to_string(),
            tenant_switcher: r#"[data-testid="tenant-switcher"]"#.to_string(),
            tenant_option: r#"[data-testid="tenant-option"]:has-text("{name}")"#.to_string(),
        }
    }
}

impl AuthLocators {
    pub fn tenant_option_for(&self, name: &str) -> String {
        self.tenant_option.replace("{name}", name)
    }
}

/// Bounded waits used by the state machine
#[derive(Debug, Clone, Copy)]
pub struct AuthTimeouts {
    /// Quick look for authenticated indicators
    pub indicator_check: Duration,
    /// Login form appearance and post-submit verification
    pub login: Duration,
    /// Each logout branch
    pub logout_step: Duration,
    pub tenant: Duration,
}

impl Default for AuthTimeouts {
    fn default() -> Self {
        Self {
            indicator_check: Duration::from_secs(2),
            login: Duration::from_secs(20),
            logout_step: Duration::from_secs(5),
            tenant: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unknown,
    Authenticated(UserType),
    LoggingOut { from: Option<UserType> },
    LoginFailed(UserType),
}

/// Whether reaching `requested` needs a logout first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentitySwitchDecision {
    pub requested: UserType,
    pub previous: Option<UserType>,
    pub logout_required: bool,
}

impl IdentitySwitchDecision {
    pub fn new(requested: UserType, previous: Option<UserType>) -> Self {
        Self {
            requested,
            previous,
            logout_required: previous.is_some_and(|p| p != requested),
        }
    }
}

/// Steps of the logout sub-state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutPhase {
    MenuOpen,
    AccountPicker,
    SignedOutPage,
    Unknown,
    BaseEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub phases: Vec<LogoutPhase>,
    /// Whether a forced navigation was needed to reach the base entry point
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Already signed in as the requested user; nothing done
    AlreadyAuthenticated,
    /// Signed in by restoring the stored session
    RestoredSession,
    /// Interactive login performed
    LoggedIn,
}

pub struct AuthOrchestrator {
    driver: Arc<dyn BrowserDriver>,
    waiter: AdaptiveWaiter,
    sessions: SessionStore,
    diagnostics: Option<Arc<dyn DiagnosticCapture>>,
    retry: RetryEngine,
    locators: AuthLocators,
    timeouts: AuthTimeouts,
    base_url: String,
    tenant: Option<String>,
    state: AuthState,
    last_user_type: Option<UserType>,
    login_submits: AtomicU32,
    logout_attempts: u32,
}

impl AuthOrchestrator {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        waiter: AdaptiveWaiter,
        sessions: SessionStore,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            waiter,
            sessions,
            diagnostics: None,
            retry: RetryEngine::new(RetryPolicy::once()),
            locators: AuthLocators::default(),
            timeouts: AuthTimeouts::default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant: None,
            state: AuthState::Unknown,
            last_user_type: None,
            login_submits: AtomicU32::new(0),
            logout_attempts: 0,
        }
    }

    pub fn with_locators(mut self, locators: AuthLocators) -> Self {
        self.locators = locators;
        self
    }

    pub fn with_timeouts(mut self, timeouts: AuthTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticCapture>) -> Self {
        self.retry = self.retry.clone().with_diagnostics(diagnostics.clone());
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Retry policy for the login submission. Defaults to a single attempt so
    /// rejected credentials are never resubmitted.
    pub fn with_login_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = self.retry.with_policy(policy);
        self
    }

    /// Tenant to (re)select after every ensure
    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn current_user(&self) -> Option<UserType> {
        self.last_user_type
    }

    pub fn login_submits(&self) -> u32 {
        self.login_submits.load(Ordering::SeqCst)
    }

    pub fn logout_attempts(&self) -> u32 {
        self.logout_attempts
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Make sure the browser is signed in as `target`
    pub async fn ensure(
        &mut self,
        target: UserType,
        credentials: &Credentials,
    ) -> E2eResult<EnsureOutcome> {
        self.enter_site().await?;

        let decision = IdentitySwitchDecision::new(target, self.last_user_type);
        debug!("Identity decision: {:?}", decision);

        if self.is_authenticated().await {
            if decision.previous == Some(target) {
                info!("Already signed in as {}; skipping login", target);
                self.state = AuthState::Authenticated(target);
                if let Err(e) = self.sessions.extend(target) {
                    warn!("Could not extend session for {}: {}", target, e);
                }
                self.select_configured_tenant().await?;
                return Ok(EnsureOutcome::AlreadyAuthenticated);
            }

            if decision.logout_required {
                info!(
                    "Switching identity {} -> {}",
                    decision.previous.map(|u| u.as_str()).unwrap_or("?"),
                    target
                );
            } else {
                info!("Signed in as an untracked identity; signing out before {}", target);
            }
            self.logout().await;
        }

        let outcome = if self.try_restore_session(target).await {
            EnsureOutcome::RestoredSession
        } else {
            self.login(target, credentials).await?;
            EnsureOutcome::LoggedIn
        };

        self.select_configured_tenant().await?;
        Ok(outcome)
    }

    /// True when any authenticated indicator shows up within the quick-check window
    pub async fn is_authenticated(&self) -> bool {
        let candidates: Vec<((), String)> = self
            .locators
            .authenticated_indicators
            .iter()
            .map(|sel| ((), sel.clone()))
            .collect();
        self.waiter
            .wait_for_any_visible(&candidates, self.timeouts.indicator_check)
            .await
            .is_ok()
    }

    /// Interactive login. Fatal on failure: captures diagnostics and propagates.
    pub async fn login(&mut self, target: UserType, credentials: &Credentials) -> E2eResult<()> {
        let operation = format!("login-{}", target);
        let result = self
            .retry
            .retry(&operation, |_ctx| self.submit_login(credentials))
            .await;

        match result {
            Ok(()) => {
                info!("Signed in as {}", target);
                self.state = AuthState::Authenticated(target);
                self.last_user_type = Some(target);
                self.persist_session(target).await;
                Ok(())
            }
            Err(e) => {
                error!("Login as {} failed: {}", target, e);
                self.capture(&operation).await;
                self.state = AuthState::LoginFailed(target);
                self.last_user_type = None;
                Err(E2eError::AuthFailed {
                    user_type: target.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Sign out of whatever identity is active. Never fails.
    pub async fn logout(&mut self) -> LogoutOutcome {
        let from = self.last_user_type;
        self.state = AuthState::LoggingOut { from };
        self.logout_attempts += 1;

        let outcome = self.run_logout().await;
        if outcome.forced {
            warn!("Logout did not complete visibly; forced navigation to {}", self.base_url);
        } else {
            info!("Signed out via {:?}", outcome.phases);
        }

        if let Some(user) = from {
            if let Err(e) = self.sessions.clear(user) {
                warn!("Could not clear stored session for {}: {}", user, e);
            }
        }
        self.last_user_type = None;
        self.state = AuthState::Unknown;
        outcome
    }

    /// Select `name` unless it is already the active tenant. Returns whether a switch happened.
    /// Fatal on failure: captures diagnostics and propagates.
    pub async fn ensure_tenant(&self, name: &str) -> E2eResult<bool> {
        if self.active_tenant_is(name).await {
            debug!("Tenant '{}' already selected", name);
            return Ok(false);
        }

        info!("Selecting tenant '{}'", name);
        if let Err(e) = self.select_tenant(name).await {
            error!("Selecting tenant '{}' failed: {}", name, e);
            self.capture(&format!("tenant-{}", name)).await;
            return Err(e);
        }
        Ok(true)
    }

    async fn select_tenant(&self, name: &str) -> E2eResult<()> {
        let option = self.locators.tenant_option_for(name);
        self.retry
            .with_policy(RetryPolicy::new(2, Duration::from_millis(500)))
            .retry(&format!("select-tenant-{}", name), |_ctx| {
                let option = option.clone();
                async move {
                    self.driver.click(&self.locators.tenant_switcher).await?;
                    self.waiter
                        .wait_for_element(&option, ElementWait::visible().with_timeout(self.timeouts.tenant))
                        .await?;
                    self.driver.click(&option).await?;
                    self.waiter
                        .wait_until(
                            &format!("tenant label shows '{}'", name),
                            self.timeouts.tenant,
                            Duration::from_millis(200),
                            || self.active_tenant_matches(name),
                        )
                        .await
                }
            })
            .await
    }

    async fn select_configured_tenant(&self) -> E2eResult<()> {
        if let Some(tenant) = self.tenant.clone() {
            self.ensure_tenant(&tenant).await?;
        }
        Ok(())
    }

    async fn active_tenant_is(&self, name: &str) -> bool {
        self.active_tenant_matches(name).await.unwrap_or(false)
    }

    async fn active_tenant_matches(&self, name: &str) -> E2eResult<bool> {
        let current = self.driver.text_content(&self.locators.tenant_label).await?;
        Ok(current.is_some_and(|text| same_tenant(&text, name)))
    }

    /// Get onto the site so indicators can be checked
    async fn enter_site(&self) -> E2eResult<()> {
        let url = self.driver.current_url().await.unwrap_or_default();
        if !url.starts_with(&self.base_url) {
            debug!("Navigating to {} (was '{}')", self.base_url, url);
            self.driver.goto(&self.base_url).await?;
            if let Err(e) = self
                .driver
                .wait_for_load_state(LoadState::DomContentLoaded, self.timeouts.login)
                .await
            {
                debug!("Load state wait after entering site: {}", e);
            }
        }
        Ok(())
    }

    /// Restore a stored session for `target`. True when that left the browser signed in.
    async fn try_restore_session(&mut self, target: UserType) -> bool {
        if !self.sessions.has_valid_session(target) {
            return false;
        }
        if self.sessions.needs_refresh(target) {
            info!("Stored session for {} is due for renewal; logging in fresh", target);
            return false;
        }
        let Some(state) = self.sessions.load_storage_state(target) else {
            return false;
        };

        if let Err(e) = self.restore_and_enter(&state).await {
            warn!("Restoring stored session for {} failed: {}", target, e);
            return false;
        }

        if self.is_authenticated().await {
            info!("Restored stored session for {}", target);
            self.state = AuthState::Authenticated(target);
            self.last_user_type = Some(target);
            if let Err(e) = self.sessions.extend(target) {
                warn!("Could not extend session for {}: {}", target, e);
            }
            true
        } else {
            warn!("Stored session for {} was rejected by the site; discarding", target);
            if let Err(e) = self.sessions.clear(target) {
                warn!("Could not clear stored session for {}: {}", target, e);
            }
            false
        }
    }

    async fn restore_and_enter(&self, state: &StorageState) -> E2eResult<()> {
        self.driver.restore_storage_state(state).await?;
        self.driver.goto(&self.base_url).await
    }

    /// One login attempt: fill, submit, verify by a positive indicator
    async fn submit_login(&self, credentials: &Credentials) -> E2eResult<()> {
        let l = &self.locators;
        let form_wait = ElementWait::visible().with_timeout(self.timeouts.login);

        if !self.driver.is_visible(&l.username_input).await.unwrap_or(false) {
            self.driver.goto(&self.base_url).await?;
        }
        self.waiter
            .wait_for_element(&l.username_input, form_wait.clone())
            .await?;
        self.driver.fill(&l.username_input, &credentials.username).await?;

        if let Some(next) = &l.next_button {
            self.driver.click(next).await?;
            self.waiter
                .wait_for_element(&l.password_input, form_wait.clone())
                .await?;
        }

        self.driver.fill(&l.password_input, &credentials.password).await?;
        self.login_submits.fetch_add(1, Ordering::SeqCst);
        self.driver.click(&l.submit_button).await?;

        #[derive(Clone, Copy, PartialEq)]
        enum Verdict {
            SignedIn,
            Rejected,
        }
        let mut candidates: Vec<(Verdict, String)> = l
            .authenticated_indicators
            .iter()
            .map(|sel| (Verdict::SignedIn, sel.clone()))
            .collect();
        candidates.push((Verdict::Rejected, l.login_error.clone()));

        match self
            .waiter
            .wait_for_any_visible(&candidates, self.timeouts.login)
            .await?
        {
            Verdict::SignedIn => Ok(()),
            Verdict::Rejected => {
                let message = self
                    .driver
                    .text_content(&l.login_error)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "credentials rejected".to_string());
                Err(E2eError::StepFailed {
                    step: "submit credentials".to_string(),
                    reason: message.trim().to_string(),
                })
            }
        }
    }

    async fn persist_session(&self, target: UserType) {
        let state = match self.driver.storage_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not read storage state after login: {}", e);
                return;
            }
        };
        if let Err(e) = self.sessions.save_storage_state(target, &state) {
            warn!("Could not save session for {}: {}", target, e);
            return;
        }
        if let Err(e) = self.sessions.mark_valid(target) {
            warn!("Could not mark session for {} valid: {}", target, e);
        }
    }

    async fn run_logout(&self) -> LogoutOutcome {
        let l = &self.locators;
        let step = self.timeouts.logout_step;
        let mut phases = Vec::new();

        if let Err(e) = self.open_logout_menu().await {
            warn!("Could not open logout menu: {}", e);
            phases.push(LogoutPhase::Unknown);
            return self.force_base_entry(phases).await;
        }
        phases.push(LogoutPhase::MenuOpen);

        let candidates = [
            (LogoutPhase::AccountPicker, l.account_picker.clone()),
            (LogoutPhase::SignedOutPage, l.signed_out_marker.clone()),
            (LogoutPhase::BaseEntry, l.login_form.clone()),
        ];
        let landing = self
            .waiter
            .wait_for_any_visible(&candidates, step)
            .await
            .unwrap_or(LogoutPhase::Unknown);
        phases.push(landing);

        match landing {
            LogoutPhase::AccountPicker => {
                let picked = async {
                    self.driver.click(&l.account_picker_tile).await?;
                    let after = [
                        (LogoutPhase::SignedOutPage, l.signed_out_marker.clone()),
                        (LogoutPhase::BaseEntry, l.login_form.clone()),
                    ];
                    self.waiter.wait_for_any_visible(&after, step).await
                }
                .await;
                match picked {
                    Ok(LogoutPhase::BaseEntry) => LogoutOutcome {
                        phases: [phases, vec![LogoutPhase::BaseEntry]].concat(),
                        forced: false,
                    },
                    Ok(phase) => {
                        phases.push(phase);
                        self.return_to_base(phases).await
                    }
                    Err(e) => {
                        debug!("Account picker did not resolve: {}", e);
                        self.force_base_entry(phases).await
                    }
                }
            }
            LogoutPhase::SignedOutPage => self.return_to_base(phases).await,
            LogoutPhase::BaseEntry => LogoutOutcome {
                phases,
                forced: false,
            },
            LogoutPhase::MenuOpen | LogoutPhase::Unknown => self.force_base_entry(phases).await,
        }
    }

    async fn open_logout_menu(&self) -> E2eResult<()> {
        let l = &self.locators;
        let wait = ElementWait::visible().with_timeout(self.timeouts.logout_step);
        self.waiter.wait_for_element(&l.user_menu, wait.clone()).await?;
        self.driver.click(&l.user_menu).await?;
        self.waiter.wait_for_element(&l.logout_item, wait).await?;
        self.driver.click(&l.logout_item).await
    }

    /// From a signed-out page, navigate back and expect the login form
    async fn return_to_base(&self, mut phases: Vec<LogoutPhase>) -> LogoutOutcome {
        let reached = async {
            self.driver.goto(&self.base_url).await?;
            self.waiter
                .wait_for_element(
                    &self.locators.login_form,
                    ElementWait::visible().with_timeout(self.timeouts.logout_step),
                )
                .await
        }
        .await;

        match reached {
            Ok(_) => {
                phases.push(LogoutPhase::BaseEntry);
                LogoutOutcome {
                    phases,
                    forced: false,
                }
            }
            Err(e) => {
                debug!("Login form did not appear after sign-out: {}", e);
                self.force_base_entry(phases).await
            }
        }
    }

    /// Last resort: navigate to the base URL, and if that still shows a
    /// signed-in page, drop the browser context's cookies entirely.
    async fn force_base_entry(&self, mut phases: Vec<LogoutPhase>) -> LogoutOutcome {
        if let Err(e) = self.driver.goto(&self.base_url).await {
            warn!("Forced navigation to {} failed: {}", self.base_url, e);
        }
        if self.is_authenticated().await {
            warn!("Still signed in after forced navigation; resetting browser context");
            let empty = StorageState {
                cookies: Vec::new(),
                origins: Vec::new(),
            };
            if let Err(e) = self.restore_and_enter(&empty).await {
                warn!("Context reset failed: {}", e);
            }
        }
        phases.push(LogoutPhase::BaseEntry);
        LogoutOutcome {
            phases,
            forced: true,
        }
    }

    async fn capture(&self, label: &str) {
        if let Some(diagnostics) = &self.diagnostics {
            if let Err(e) = diagnostics.capture(label).await {
                warn!("Diagnostic capture '{}' failed: {}", label, e);
            }
        }
    }
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Tenant names compare case-insensitively with whitespace collapsed
fn same_tenant(shown: &str, wanted: &str) -> bool {
    let norm = |s: &str| WHITESPACE.replace_all(s.trim(), " ").to_lowercase();
    norm(shown) == norm(wanted)
}
