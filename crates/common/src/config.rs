//! Harness configuration
//!
//! Site, timing and output settings come from a TOML file (absent file means
//! defaults) with an environment overlay. Credentials only ever come from the
//! environment and are required up front: a missing variable is a fatal
//! configuration error raised before any browser work starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Credentials, UserType};

pub const ENV_BASE_URL: &str = "ALERTWATCH_BASE_URL";
pub const ENV_TENANT: &str = "ALERTWATCH_TENANT";
pub const ENV_SESSION_DIR: &str = "ALERTWATCH_SESSION_DIR";

/// Harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub site: SiteConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub waits: WaitConfig,
    pub cleanup: CleanupConfig,
    pub visual: VisualConfig,
    pub output: OutputConfig,
}

/// Target site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Base entry point; also the forced-navigation target after a stuck logout
    pub base_url: String,

    /// Tenant (company) to select after login, if any
    pub tenant: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            tenant: None,
        }
    }
}

/// Session persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding the per-user-type session files
    pub dir: PathBuf,

    /// Hard validity window
    pub validity_secs: u64,

    /// Age after which a session should be renewed proactively
    pub refresh_after_secs: u64,
}

impl SessionConfig {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn refresh_after(&self) -> Duration {
        Duration::from_secs(self.refresh_after_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".auth"),
            validity_secs: 30 * 60,
            refresh_after_secs: 20 * 60,
        }
    }
}

/// Retry defaults for wrapped UI operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Adaptive wait tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub element_timeout_ms: u64,
    pub stability_attempts: u32,
    pub stability_interval_ms: u64,
    pub count_minimum_wait_ms: u64,
    pub count_max_wait_ms: u64,
    pub count_check_interval_ms: u64,
    pub count_required_stable_checks: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            element_timeout_ms: 10_000,
            stability_attempts: 6,
            stability_interval_ms: 150,
            count_minimum_wait_ms: 500,
            count_max_wait_ms: 8_000,
            count_check_interval_ms: 300,
            count_required_stable_checks: 2,
        }
    }
}

/// Teardown limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Hard ceiling on "remove first row" iterations
    pub max_unsuppress_iterations: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_unsuppress_iterations: 25,
        }
    }
}

/// Screenshot comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Per-attempt pixel-difference thresholds in percent. Later entries are
    /// looser; a pass on any entry after the first is reported for review.
    pub threshold_schedule: Vec<f64>,

    /// Delay before re-taking a screenshot between attempts
    pub retake_delay_ms: u64,

    pub baseline_dir: PathBuf,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            threshold_schedule: vec![0.5],
            retake_delay_ms: 500,
            baseline_dir: PathBuf::from("test-results/baselines"),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub debug_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            debug_dir: PathBuf::from("test-results/debug"),
            results_dir: PathBuf::from("test-results"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay site and session settings from the environment
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = non_empty(lookup(ENV_BASE_URL)) {
            self.site.base_url = url;
        }
        if let Some(tenant) = non_empty(lookup(ENV_TENANT)) {
            self.site.tenant = Some(tenant);
        }
        if let Some(dir) = non_empty(lookup(ENV_SESSION_DIR)) {
            self.session.dir = PathBuf::from(dir);
        }
    }

    /// Reject settings that would make the harness misbehave silently
    pub fn validate(&self) -> Result<()> {
        let url = self.site.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "site.base_url must be an http(s) URL, got '{}'",
                self.site.base_url
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.session.refresh_after_secs >= self.session.validity_secs {
            return Err(Error::InvalidConfig(format!(
                "session.refresh_after_secs ({}) must be shorter than session.validity_secs ({})",
                self.session.refresh_after_secs, self.session.validity_secs
            )));
        }
        if self.visual.threshold_schedule.is_empty() {
            return Err(Error::InvalidConfig(
                "visual.threshold_schedule needs at least one threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.site.base_url.trim_end_matches('/')
    }
}

/// Credentials for every user type, read from the environment
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub admin: Credentials,
    pub normal: Credentials,
}

impl IdentityConfig {
    /// Read credentials from the process environment
    pub fn from_process_env() -> Result<Self> {
        Self::from_env(|key| std::env::var(key).ok())
    }

    /// Read credentials through `lookup`; the first missing variable is reported by name
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            admin: credentials_for(UserType::Admin, &lookup)?,
            normal: credentials_for(UserType::Normal, &lookup)?,
        })
    }

    pub fn credentials(&self, user_type: UserType) -> &Credentials {
        match user_type {
            UserType::Admin => &self.admin,
            UserType::Normal => &self.normal,
        }
    }
}

/// Environment variable names for a user type's credentials
pub fn credential_vars(user_type: UserType) -> (String, String) {
    let prefix = format!("ALERTWATCH_{}", user_type.as_str().to_ascii_uppercase());
    (format!("{}_USERNAME", prefix), format!("{}_PASSWORD", prefix))
}

fn credentials_for<F>(user_type: UserType, lookup: &F) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let (user_var, pass_var) = credential_vars(user_type);
    let username = non_empty(lookup(&user_var)).ok_or(Error::MissingEnv(user_var))?;
    let password = non_empty(lookup(&pass_var)).ok_or(Error::MissingEnv(pass_var))?;
    Ok(Credentials::new(username, password))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.session.validity(), Duration::from_secs(1800));
        assert_eq!(config.session.refresh_after(), Duration::from_secs(1200));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_missing_credentials_named_in_error() {
        let lookup = env(&[
            ("ALERTWATCH_ADMIN_USERNAME", "admin@example.com"),
            ("ALERTWATCH_ADMIN_PASSWORD", "secret"),
            ("ALERTWATCH_NORMAL_USERNAME", "user@example.com"),
            ("ALERTWATCH_NORMAL_PASSWORD", "  "),
        ]);
        let err = IdentityConfig::from_env(lookup).unwrap_err();
        assert!(err.to_string().contains("ALERTWATCH_NORMAL_PASSWORD"));
    }

    #[test]
    fn test_credentials_resolved_per_user_type() {
        let lookup = env(&[
            ("ALERTWATCH_ADMIN_USERNAME", "admin@example.com"),
            ("ALERTWATCH_ADMIN_PASSWORD", "a"),
            ("ALERTWATCH_NORMAL_USERNAME", "user@example.com"),
            ("ALERTWATCH_NORMAL_PASSWORD", "n"),
        ]);
        let identities = IdentityConfig::from_env(lookup).unwrap();
        assert_eq!(identities.credentials(UserType::Admin).username, "admin@example.com");
        assert_eq!(identities.credentials(UserType::Normal).password, "n");
    }

    #[test]
    fn test_env_overlay() {
        let mut config = HarnessConfig::default();
        config.apply_env(env(&[
            (ENV_BASE_URL, "https://dash.example.com/"),
            (ENV_TENANT, "Acme Ops"),
        ]));
        assert_eq!(config.base_url(), "https://dash.example.com");
        assert_eq!(config.site.tenant.as_deref(), Some("Acme Ops"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HarnessConfig::default();
        config.site.base_url = "dash.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.session.refresh_after_secs = config.session.validity_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alertwatch.toml");
        assert_eq!(
            HarnessConfig::load(&path).unwrap().retry.base_delay_ms,
            1000
        );

        let mut config = HarnessConfig::default();
        config.visual.threshold_schedule = vec![0.5, 1.0, 2.0];
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.visual.threshold_schedule, vec![0.5, 1.0, 2.0]);
    }
}
