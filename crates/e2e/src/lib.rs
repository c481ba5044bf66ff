//! AlertWatch E2E Harness
//!
//! Reliability layer for driving the AlertWatch incident dashboard through a
//! real browser:
//! - Reuses signed-in sessions across runs and skips redundant logins
//! - Retries flaky UI operations with exponential backoff
//! - Waits on positive UI signals instead of fixed sleeps or network idle
//! - Reverts test-induced state after every scenario
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TestRunner (sequential)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AuthOrchestrator ── SessionStore (alertwatch-common)       │
//! │    └── ensure(user) -> AlreadyAuthenticated | Restored |    │
//! │                        LoggedIn                             │
//! │  WorkflowDriver                                             │
//! │    ├── create_alert / apply_filter / suppress / dispatch    │
//! │    └── every action: RetryEngine + AdaptiveWaiter           │
//! │  CleanupRegistry ── CleanupCoordinator                      │
//! │    └── best-effort | mandatory, always after the body       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserDriver (trait)                                      │
//! │    └── PlaywrightDriver: node bridge, JSON lines            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod cleanup;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod playwright;
pub mod retry;
pub mod runner;
pub mod spec;
pub mod visual;
pub mod wait;
pub mod workflow;

#[cfg(feature = "testing")]
pub mod testing;

pub use auth::{AuthOrchestrator, EnsureOutcome};
pub use cleanup::{CleanupCoordinator, CleanupRegistry, CleanupReport, Criticality};
pub use driver::BrowserDriver;
pub use error::{E2eError, E2eResult};
pub use retry::{retry, RetryEngine, RetryPolicy};
pub use runner::{RunnerConfig, TestRunner, TestSuiteResult};
pub use spec::{TestSpec, TestStep};
pub use wait::AdaptiveWaiter;
pub use workflow::WorkflowDriver;
