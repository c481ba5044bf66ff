//! Browser driver boundary
//!
//! Everything above this trait (auth, waits, workflows, cleanup) talks to the
//! browser only through [`BrowserDriver`], so any engine that provides these
//! capabilities can be substituted. [`crate::playwright::PlaywrightDriver`]
//! is the production implementation.

use std::path::Path;
use std::time::Duration;

use alertwatch_common::{BoundingBox, StorageState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::E2eResult;

/// Element state to wait for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

/// Page lifecycle states.
///
/// There is deliberately no network-idle state: the dashboard streams
/// updates continuously and never goes idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Load,
    DomContentLoaded,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Load => "load",
            LoadState::DomContentLoaded => "domcontentloaded",
        }
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Navigate to an absolute URL
    async fn goto(&self, url: &str) -> E2eResult<()>;

    async fn current_url(&self) -> E2eResult<String>;

    /// Wait for the first element matching `selector` to reach `state`.
    /// Fails with [`crate::error::E2eError::Timeout`] when `timeout` elapses.
    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()>;

    /// Instantaneous visibility check; never waits
    async fn is_visible(&self, selector: &str) -> E2eResult<bool>;

    async fn click(&self, selector: &str) -> E2eResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn hover(&self, selector: &str) -> E2eResult<()>;

    async fn press(&self, selector: &str, key: &str) -> E2eResult<()>;

    /// Number of elements currently matching `selector`
    async fn count(&self, selector: &str) -> E2eResult<usize>;

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>>;

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>>;

    /// Evaluate a script in the page and return its JSON result
    async fn evaluate(&self, script: &str) -> E2eResult<serde_json::Value>;

    async fn screenshot(&self, path: &Path) -> E2eResult<()>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> E2eResult<()>;

    /// Snapshot cookies and origin storage of the current context
    async fn storage_state(&self) -> E2eResult<StorageState>;

    /// Replace the browser context with one seeded from `state`
    async fn restore_storage_state(&self, state: &StorageState) -> E2eResult<()>;
}
