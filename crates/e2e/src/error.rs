//! Error types for E2E testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Playwright not found. Install with: npm i playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Element not found: tried {selectors:?} within {timeout_ms} ms")]
    ElementNotFound {
        selectors: Vec<String>,
        timeout_ms: u64,
    },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<E2eError>,
    },

    #[error("Login as {user_type} failed: {source}")]
    AuthFailed {
        user_type: String,
        #[source]
        source: Box<E2eError>,
    },

    #[error("Mandatory cleanup failed: {}", .failures.join("; "))]
    CleanupFailed { failures: Vec<String> },

    #[error("UI did not reach expected state: {0}")]
    StaleState(String),

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Visual regression: {0}")]
    VisualRegression(String),

    #[error("Screenshot mismatch: {name} differs by {diff_percent:.2}% (threshold: {threshold:.2}%)")]
    ScreenshotMismatch {
        name: String,
        diff_percent: f64,
        threshold: f64,
    },

    #[error("Baseline not found: {0}")]
    BaselineNotFound(String),

    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error(transparent)]
    Config(#[from] alertwatch_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type E2eResult<T> = Result<T, E2eError>;
