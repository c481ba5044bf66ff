//! Failure diagnostics: screenshots and page-state dumps for humans
//!
//! Output lands in the debug directory as
//! `<label>-<timestamp>.png`, `.html` and `.json`. Nothing in the harness
//! reads these back; every caller treats capture failure as non-fatal.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::driver::BrowserDriver;
use crate::error::E2eResult;

#[async_trait]
pub trait DiagnosticCapture: Send + Sync {
    /// Capture the current UI state; returns the screenshot path
    async fn capture(&self, label: &str) -> E2eResult<PathBuf>;
}

/// Writes screenshots and page dumps through a [`BrowserDriver`]
#[derive(Clone)]
pub struct DiagnosticSink {
    driver: Arc<dyn BrowserDriver>,
    debug_dir: PathBuf,
    dump_page: bool,
}

#[derive(Debug, Serialize)]
struct PageStateDump<'a> {
    label: &'a str,
    url: Option<String>,
    captured_at: String,
    screenshot: String,
}

impl DiagnosticSink {
    pub fn new(driver: Arc<dyn BrowserDriver>, debug_dir: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            debug_dir: debug_dir.into(),
            dump_page: true,
        }
    }

    /// Skip the HTML/JSON dumps and only take screenshots
    pub fn screenshots_only(mut self) -> Self {
        self.dump_page = false;
        self
    }

    pub fn debug_dir(&self) -> &std::path::Path {
        &self.debug_dir
    }

    fn stem(&self, label: &str) -> String {
        format!(
            "{}-{}",
            sanitize_label(label),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        )
    }
}

#[async_trait]
impl DiagnosticCapture for DiagnosticSink {
    async fn capture(&self, label: &str) -> E2eResult<PathBuf> {
        tokio::fs::create_dir_all(&self.debug_dir).await?;
        let stem = self.stem(label);
        let screenshot = self.debug_dir.join(format!("{}.png", stem));

        self.driver.screenshot(&screenshot).await?;
        debug!("Saved diagnostic screenshot {}", screenshot.display());

        if self.dump_page {
            match self
                .driver
                .evaluate("document.documentElement.outerHTML")
                .await
            {
                Ok(serde_json::Value::String(html)) => {
                    tokio::fs::write(self.debug_dir.join(format!("{}.html", stem)), html).await?;
                }
                Ok(_) => {}
                Err(e) => warn!("HTML dump for '{}' failed: {}", label, e),
            }

            let dump = PageStateDump {
                label,
                url: self.driver.current_url().await.ok(),
                captured_at: Utc::now().to_rfc3339(),
                screenshot: screenshot.to_string_lossy().to_string(),
            };
            tokio::fs::write(
                self.debug_dir.join(format!("{}.json", stem)),
                serde_json::to_vec_pretty(&dump)?,
            )
            .await?;
        }

        Ok(screenshot)
    }
}

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));

/// Filesystem-safe form of an operation or test name
pub fn sanitize_label(label: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(label.trim(), "-");
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "capture".to_string()
    } else {
        cleaned.chars().take(80).collect()
    }
}
