//! Declarative YAML scenarios
//!
//! ```yaml
//! name: suppress-critical
//! tags: [suppression, smoke]
//! user: admin
//! steps:
//!   - action: create_alert
//!     title: CPU high on web-01
//!     severity: critical
//!     source: prometheus
//!   - action: suppress
//!     alert_title: CPU high on web-01
//!     duration_minutes: 30
//!   - action: expect_count
//!     stack: all
//!     equals: 0
//! ```

use std::collections::HashSet;
use std::path::Path;

use alertwatch_common::UserType;
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};
use crate::workflow::{AlertDraft, DispatchRequest, FilterSpec, ReportRequest, SuppressionRule};

/// A complete scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Unique name for this test
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering tests
    #[serde(default)]
    pub tags: Vec<String>,

    /// Identity the scenario runs as
    #[serde(default = "default_user")]
    pub user: UserType,

    /// Tenant to select; overrides the configured one
    #[serde(default)]
    pub tenant: Option<String>,

    /// Steps to execute in order
    pub steps: Vec<TestStep>,
}

fn default_user() -> UserType {
    UserType::Normal
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    OpenStack {
        stack: String,
    },

    CreateAlert(AlertDraft),

    ApplyFilter {
        stack: String,
        #[serde(flatten)]
        filter: FilterSpec,
    },

    Suppress(SuppressionRule),

    Dispatch(DispatchRequest),

    GenerateReport(ReportRequest),

    /// Assert on the settled row count of a stack (or of the current view)
    ExpectCount {
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        equals: Option<usize>,
        #[serde(default)]
        at_least: Option<usize>,
    },

    /// Wait for an element's geometry to stop changing
    WaitStable {
        selector: String,
    },

    /// Take a screenshot; with `compare` it is checked against the baseline
    Screenshot {
        name: String,
        #[serde(default)]
        compare: bool,
    },
}

impl TestStep {
    /// Short label for logs and results
    pub fn label(&self) -> String {
        match self {
            TestStep::OpenStack { stack } => format!("open_stack:{}", stack),
            TestStep::CreateAlert(draft) => format!("create_alert:{}", draft.title),
            TestStep::ApplyFilter { stack, filter } => {
                format!("apply_filter:{}:{}={}", stack, filter.field, filter.value)
            }
            TestStep::Suppress(rule) => format!("suppress:{}", rule.alert_title),
            TestStep::Dispatch(req) => format!("dispatch:{}->{}", req.alert_title, req.target),
            TestStep::GenerateReport(req) => format!("generate_report:{}", req.kind),
            TestStep::ExpectCount { stack, .. } => {
                format!("expect_count:{}", stack.as_deref().unwrap_or("current"))
            }
            TestStep::WaitStable { selector } => format!("wait_stable:{}", selector),
            TestStep::Screenshot { name, .. } => format!("screenshot:{}", name),
        }
    }
}

impl TestSpec {
    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load every `.yaml`/`.yml` under `dir`, ordered by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut specs = Vec::new();
        let mut names = HashSet::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            let spec = Self::from_file(entry.path())?;
            if !names.insert(spec.name.clone()) {
                return Err(E2eError::SpecParse(format!(
                    "duplicate scenario name '{}' in {}",
                    spec.name,
                    entry.path().display()
                )));
            }
            specs.push(spec);
        }

        Ok(specs)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn validate(&self) -> E2eResult<()> {
        if self.name.trim().is_empty() {
            return Err(E2eError::SpecParse("scenario name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(E2eError::SpecParse(format!("'{}' has no steps", self.name)));
        }
        for step in &self.steps {
            if let TestStep::ExpectCount {
                equals: None,
                at_least: None,
                ..
            } = step
            {
                return Err(E2eError::SpecParse(format!(
                    "'{}': expect_count needs `equals` or `at_least`",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
