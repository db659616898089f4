//! Test agents run a fixed battery of checks against the running preview and
//! report uniformly; the [`runner::TestRunner`] dispatches test actions to
//! them.

pub mod accessibility;
pub mod api;
pub mod browser;
pub mod performance;
pub mod probe;
pub mod runner;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::actions::Action;
use crate::config::PerformanceThresholds;

pub use probe::{HttpProbe, ProbeError, ProbeResponse, ReqwestProbe, StaticProbe};
pub use runner::TestRunner;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Browser,
    Api,
    Accessibility,
    Performance,
}

impl std::fmt::Display for TestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestCategory::Browser => "browser",
            TestCategory::Api => "api",
            TestCategory::Accessibility => "accessibility",
            TestCategory::Performance => "performance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            test_name: name.into(),
            status: TestStatus::Passed,
            error: None,
            details: Some(details.into()),
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            test_name: name.into(),
            status: TestStatus::Failed,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn warning(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            test_name: name.into(),
            status: TestStatus::Warning,
            error: None,
            details: Some(details.into()),
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            test_name: name.into(),
            status: TestStatus::Skipped,
            error: None,
            details: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TestStatus::Failed
    }
}

/// Counts over a report's results. Warnings count as passed, so
/// `passed + failed + skipped == total` always holds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TestSummary {
    pub fn from_results(results: &[TestResult]) -> Self {
        let count = |pred: fn(&TestStatus) -> bool| results.iter().filter(|r| pred(&r.status)).count();
        Self {
            total: results.len(),
            passed: count(|s| matches!(s, TestStatus::Passed | TestStatus::Warning)),
            failed: count(|s| matches!(s, TestStatus::Failed)),
            skipped: count(|s| matches!(s, TestStatus::Skipped)),
        }
    }
}

/// Immutable outcome of one test action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds.
    pub duration: u64,
    pub results: Vec<TestResult>,
    pub summary: TestSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl TestReport {
    pub fn failed_results(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| r.is_failed())
    }

    /// Fraction of results that failed, 0.0 for an empty report.
    pub fn failure_rate(&self) -> f64 {
        if self.summary.total == 0 {
            0.0
        } else {
            self.summary.failed as f64 / self.summary.total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ApiEndpoint {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: default_method(),
            expected_status: None,
        }
    }
}

/// Per-action test options carried by a `test` action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TestConfig {
    /// Overrides the configured preview URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<ApiEndpoint>,
    pub check_seo: bool,
    pub check_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<PerformanceThresholds>,
}

/// What every agent gets to work with.
#[derive(Clone)]
pub struct TestContext {
    pub preview_url: String,
    pub probe: Arc<dyn HttpProbe>,
    pub thresholds: PerformanceThresholds,
    pub api_response_time_ms: u64,
}

impl TestContext {
    pub fn target_url(&self, config: &TestConfig) -> String {
        config
            .url
            .clone()
            .unwrap_or_else(|| self.preview_url.clone())
            .trim_end_matches('/')
            .to_string()
    }
}

#[async_trait]
pub trait TestAgent: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> TestCategory;

    fn can_handle(&self, action: &Action) -> bool {
        matches!(action, Action::Test { test_type, .. } if *test_type == self.category())
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &TestContext, config: &TestConfig) -> TestReport;

    /// Extra hints for a failed check, keyed by its test name.
    fn category_suggestions(&self, _failed: &TestResult) -> Vec<String> {
        Vec::new()
    }
}

/// Run one check; an error becomes a single failed result instead of
/// aborting the battery.
pub async fn run_check<F>(name: &str, check: F) -> TestResult
where
    F: Future<Output = Result<TestResult>>,
{
    match check.await {
        Ok(result) => result,
        Err(e) => {
            warn!(check = name, "check errored: {:#}", e);
            TestResult::failed(name, e.to_string())
        }
    }
}

/// Generic hints derived from the error text of failed results.
pub fn base_suggestions(results: &[TestResult]) -> Vec<String> {
    let mut suggestions = Vec::new();
    for result in results.iter().filter(|r| r.is_failed()) {
        let error = result.error.as_deref().unwrap_or_default();
        if error.contains("TypeError") {
            suggestions.push("Check for undefined values and wrong types before property access".to_string());
        }
        if error.contains("ReferenceError") {
            suggestions.push("Make sure every variable and function is declared before use".to_string());
        }
        if error.contains("404") {
            suggestions.push("Verify that the requested routes and files exist".to_string());
        }
        if error.to_lowercase().contains("timeout") || error.contains("timed out") {
            suggestions.push("Check whether the server is running and responding in time".to_string());
        }
    }
    suggestions
}

/// Assemble a report: summary counts plus deduplicated suggestions.
pub fn build_report(agent: &dyn TestAgent, results: Vec<TestResult>, started: Instant) -> TestReport {
    let mut suggestions = base_suggestions(&results);
    for failed in results.iter().filter(|r| r.is_failed()) {
        suggestions.extend(agent.category_suggestions(failed));
    }

    let mut seen = HashSet::new();
    suggestions.retain(|s| seen.insert(s.clone()));

    TestReport {
        agent_name: agent.name().to_string(),
        timestamp: Utc::now(),
        duration: started.elapsed().as_millis() as u64,
        summary: TestSummary::from_results(&results),
        results,
        suggestions,
    }
}

/// Resolve `href` against `base`, dropping anchors and non-HTTP schemes.
pub(crate) fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("javascript:")
        || href.starts_with("data:")
    {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    if let Some(rest) = href.strip_prefix("//") {
        return Some(format!("http://{rest}"));
    }

    let origin = origin_of(base);
    if href.starts_with('/') {
        Some(format!("{origin}{href}"))
    } else {
        Some(format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches("./")))
    }
}

/// `scheme://host[:port]` of a URL.
pub(crate) fn origin_of(url: &str) -> String {
    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[scheme_end..].find('/') {
        Some(idx) => url[..scheme_end + idx].to_string(),
        None => url.to_string(),
    }
}
