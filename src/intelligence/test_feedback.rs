use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{extract_tagged, wrap_tagged};
use crate::testing::{TestReport, TestResult, TestStatus};

pub const TEST_RESULTS_OPEN: &str = "<test_results>";
pub const TEST_RESULTS_CLOSE: &str = "</test_results>";

/// Failure rate below which a report is only a warning.
const WARNING_FAILURE_RATE: f64 = 0.3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    Success,
    Warning,
    Error,
}

/// Classify a failed check by its test name and error text.
fn failure_type(result: &TestResult) -> &'static str {
    let name = result.test_name.to_lowercase();
    let error = result.error.as_deref().unwrap_or_default().to_lowercase();

    if name.contains("page load") || error.contains("connection") {
        "availability"
    } else if name.contains("link") || name.contains("image") || error.contains("404") {
        "missing-resource"
    } else if name.starts_with("endpoint") || name.contains("404 handling") {
        "api"
    } else if name.contains("time") || name.contains("size") || name.contains("resource") || error.contains("timed out")
    {
        "performance"
    } else if name.contains("alt") || name.contains("label") || name.contains("heading") {
        "accessibility"
    } else if error.contains("typeerror") || error.contains("referenceerror") || name.contains("console") {
        "runtime"
    } else {
        "general"
    }
}

fn fix_instructions(failure_type: &str) -> &'static [&'static str] {
    match failure_type {
        "availability" => &[
            "Make sure the dev server was started and did not crash",
            "Check the terminal output for compilation errors and fix them first",
            "Confirm the app listens on the expected port",
        ],
        "missing-resource" => &[
            "Create the missing file or route, or remove the reference to it",
            "Check paths for typos and letter case",
            "Put static assets in the public directory",
        ],
        "api" => &[
            "Register the route with the expected HTTP method",
            "Return the documented status code for each outcome",
            "Add a catch-all handler that responds 404 for unknown routes",
        ],
        "performance" => &[
            "Split large bundles and lazy-load heavy components",
            "Reduce the number of requested scripts, styles and images",
            "Move slow work out of request handlers or cache its results",
        ],
        "accessibility" => &[
            "Give every image an alt attribute",
            "Associate every form field with a label",
            "Use exactly one <h1> and a logical heading order",
        ],
        "runtime" => &[
            "Guard against undefined and null values before property access",
            "Declare every variable and import every function before use",
        ],
        _ => &[
            "Read the error message and fix the code it points at",
            "Re-run the tests after applying the fix",
        ],
    }
}

fn status_icon(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "✅",
        TestStatus::Failed => "❌",
        TestStatus::Skipped => "⏭️",
        TestStatus::Warning => "⚠️",
    }
}

/// Formatting for test reports: UI markdown, LLM prompt and the tagged
/// message payload.
pub struct TestFeedback;

impl TestFeedback {
    pub fn severity(report: &TestReport) -> TestSeverity {
        let rate = report.failure_rate();
        if rate == 0.0 {
            TestSeverity::Success
        } else if rate < WARNING_FAILURE_RATE {
            TestSeverity::Warning
        } else {
            TestSeverity::Error
        }
    }

    pub fn summary(report: &TestReport) -> String {
        let s = &report.summary;
        format!(
            "{}: {}/{} passed, {} failed, {} skipped ({}ms)",
            report.agent_name, s.passed, s.total, s.failed, s.skipped, report.duration
        )
    }

    /// Markdown for the UI, one section per status.
    pub fn format_markdown(report: &TestReport) -> String {
        let header = match Self::severity(report) {
            TestSeverity::Success => "✅ All tests passed",
            TestSeverity::Warning => "⚠️ Some tests failed",
            TestSeverity::Error => "❌ Tests failed",
        };
        let mut output = format!("## {header}\n\n**{}**\n\n", Self::summary(report));

        for (title, status) in [
            ("Failed", TestStatus::Failed),
            ("Warnings", TestStatus::Warning),
            ("Passed", TestStatus::Passed),
            ("Skipped", TestStatus::Skipped),
        ] {
            let matching: Vec<&TestResult> = report.results.iter().filter(|r| r.status == status).collect();
            if matching.is_empty() {
                continue;
            }
            output.push_str(&format!("### {title} ({})\n\n", matching.len()));
            for result in matching {
                let text = result.error.as_deref().or(result.details.as_deref()).unwrap_or_default();
                if text.is_empty() {
                    output.push_str(&format!("- {} {}\n", status_icon(status), result.test_name));
                } else {
                    output.push_str(&format!("- {} **{}**: {}\n", status_icon(status), result.test_name, text));
                }
            }
            output.push('\n');
        }

        if !report.suggestions.is_empty() {
            output.push_str("### Suggestions\n\n");
            for suggestion in &report.suggestions {
                output.push_str(&format!("- 💡 {suggestion}\n"));
            }
        }
        output
    }

    /// Prompt asking the model to fix every failed check.
    pub fn format_for_llm(report: &TestReport) -> String {
        let failed: Vec<&TestResult> = report.failed_results().collect();
        if failed.is_empty() {
            return format!(
                "All {} checks from {} passed. No fixes are needed.",
                report.summary.total, report.agent_name
            );
        }

        let mut prompt = format!(
            "{} reported {} failing checks out of {}. Fix ALL of them.\n\n",
            report.agent_name,
            failed.len(),
            report.summary.total
        );
        for (index, result) in failed.iter().enumerate() {
            let kind = failure_type(result);
            prompt.push_str(&format!(
                "{}. [{}] {}\n   Error: {}\n   How to fix:\n",
                index + 1,
                kind.to_uppercase(),
                result.test_name,
                result.error.as_deref().unwrap_or("no details")
            ));
            for instruction in fix_instructions(kind) {
                prompt.push_str(&format!("   - {instruction}\n"));
            }
            prompt.push('\n');
        }

        if !report.suggestions.is_empty() {
            prompt.push_str("Suggestions:\n");
            for suggestion in &report.suggestions {
                prompt.push_str(&format!("- {suggestion}\n"));
            }
            prompt.push('\n');
        }
        prompt.push_str("Apply the fixes by rewriting the affected files in full.");
        prompt
    }

    pub fn format_for_message(report: &TestReport) -> String {
        let payload = serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string());
        wrap_tagged(&payload, TEST_RESULTS_OPEN, TEST_RESULTS_CLOSE)
    }

    /// Recover a report embedded by [`Self::format_for_message`].
    pub fn parse_test_results(message: &str) -> Option<TestReport> {
        let payload = extract_tagged(message, TEST_RESULTS_OPEN, TEST_RESULTS_CLOSE)?;
        serde_json::from_str(payload)
            .map_err(|e| warn!("invalid test result payload: {}", e))
            .ok()
    }
}
