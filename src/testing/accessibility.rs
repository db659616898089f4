use async_trait::async_trait;
use regex::Regex;
use std::time::Instant;
use tracing::info;

use super::{build_report, TestAgent, TestCategory, TestConfig, TestContext, TestReport, TestResult};

lazy_static::lazy_static! {
    static ref IMG_TAG: Regex = Regex::new(r"(?i)<img\b[^>]*>").unwrap();
    static ref ALT_ATTR: Regex = Regex::new(r#"(?i)\balt\s*=\s*["']"#).unwrap();
    static ref H1: Regex = Regex::new(r"(?i)<h1\b").unwrap();
    static ref SKIP_LINK: Regex =
        Regex::new(r#"(?i)<a\b[^>]*(?:href\s*=\s*["']#(?:main|content|main-content)["']|class\s*=\s*["'][^"']*skip)"#).unwrap();
    static ref ARIA_ATTR: Regex = Regex::new(r#"(?i)\s(?:aria-[a-z]+|role)\s*="#).unwrap();
    static ref CONTROL: Regex = Regex::new(r"(?i)<(?:button|select|textarea|input)\b[^>]*>").unwrap();
    static ref NON_LABELLED_INPUT: Regex =
        Regex::new(r#"(?i)\btype\s*=\s*["'](?:hidden|submit|button|reset|image)["']"#).unwrap();
    static ref LABEL: Regex = Regex::new(r"(?i)<label\b").unwrap();
    static ref INLINE_LABEL: Regex = Regex::new(r#"(?i)\b(?:aria-label|aria-labelledby|title)\s*=\s*["']"#).unwrap();
    static ref MAIN_LANDMARK: Regex = Regex::new(r#"(?i)<main\b|role\s*=\s*["']main["']"#).unwrap();
    static ref OTHER_LANDMARK: Regex = Regex::new(r"(?i)<(?:nav|header|footer|aside)\b").unwrap();
}

/// Static WCAG heuristics over the raw HTML.
pub struct AccessibilityTestAgent;

impl AccessibilityTestAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AccessibilityTestAgent {
    fn default() -> Self {
        Self::new()
    }
}

const CHECKS: &[&str] = &[
    "Image Alt Text",
    "Heading Hierarchy",
    "Color Contrast",
    "Keyboard Navigation",
    "ARIA Usage",
    "Form Labels",
    "Landmarks",
];

fn check_alt_text(html: &str) -> TestResult {
    let images: Vec<&str> = IMG_TAG.find_iter(html).map(|m| m.as_str()).collect();
    let missing = images.iter().filter(|img| !ALT_ATTR.is_match(img)).count();
    if missing == 0 {
        TestResult::passed("Image Alt Text", format!("WCAG 1.1.1: {} images have alt text", images.len()))
    } else {
        TestResult::failed(
            "Image Alt Text",
            format!("WCAG 1.1.1: {} of {} images are missing alt text", missing, images.len()),
        )
    }
}

fn check_headings(html: &str) -> TestResult {
    match H1.find_iter(html).count() {
        0 => TestResult::failed("Heading Hierarchy", "WCAG 1.3.1: page has no <h1>"),
        1 => TestResult::passed("Heading Hierarchy", "WCAG 1.3.1: exactly one <h1>"),
        n => TestResult::warning("Heading Hierarchy", format!("WCAG 1.3.1: page has {n} <h1> elements")),
    }
}

/// Contrast needs computed styles; reported as a reminder only.
fn check_contrast() -> TestResult {
    TestResult::passed(
        "Color Contrast",
        "WCAG 1.4.3: not measurable from HTML; verify text contrast is at least 4.5:1",
    )
}

fn check_keyboard(html: &str) -> TestResult {
    if SKIP_LINK.is_match(html) {
        TestResult::passed("Keyboard Navigation", "WCAG 2.1.1: skip link present")
    } else {
        TestResult::warning(
            "Keyboard Navigation",
            "WCAG 2.1.1: no skip-to-content link found",
        )
    }
}

fn check_aria(html: &str) -> TestResult {
    let aria = ARIA_ATTR.find_iter(html).count();
    let controls = CONTROL.find_iter(html).count();
    if aria == 0 && controls > 0 {
        TestResult::warning(
            "ARIA Usage",
            format!("WCAG 4.1.2: {controls} interactive elements and no ARIA attributes"),
        )
    } else {
        TestResult::passed("ARIA Usage", format!("WCAG 4.1.2: {aria} ARIA attributes"))
    }
}

fn check_form_labels(html: &str) -> TestResult {
    let fields: Vec<&str> = CONTROL
        .find_iter(html)
        .map(|m| m.as_str())
        .filter(|tag| !tag.to_lowercase().starts_with("<button"))
        .filter(|tag| !NON_LABELLED_INPUT.is_match(tag))
        .collect();
    let inline = fields.iter().filter(|tag| INLINE_LABEL.is_match(tag)).count();
    let labels = LABEL.find_iter(html).count();
    let unlabelled = fields.len().saturating_sub(inline + labels);

    if unlabelled == 0 {
        TestResult::passed("Form Labels", format!("WCAG 3.3.2: {} form fields labelled", fields.len()))
    } else {
        TestResult::failed(
            "Form Labels",
            format!("WCAG 3.3.2: {} of {} form fields have no label", unlabelled, fields.len()),
        )
    }
}

fn check_landmarks(html: &str) -> TestResult {
    let has_main = MAIN_LANDMARK.is_match(html);
    let others = OTHER_LANDMARK.find_iter(html).count();
    if has_main {
        TestResult::passed("Landmarks", format!("WCAG 1.3.1: <main> plus {others} other landmarks"))
    } else {
        TestResult::warning("Landmarks", "WCAG 1.3.1: no <main> landmark")
    }
}

#[async_trait]
impl TestAgent for AccessibilityTestAgent {
    fn name(&self) -> &str {
        "AccessibilityTestAgent"
    }

    fn category(&self) -> TestCategory {
        TestCategory::Accessibility
    }

    async fn execute(&self, ctx: &TestContext, config: &TestConfig) -> TestReport {
        let started = Instant::now();
        let url = ctx.target_url(config);
        info!(%url, "running accessibility checks");

        let html = match ctx.probe.get(&url).await {
            Ok(response) if response.is_success() => response.body,
            Ok(response) => {
                let reason = format!("Page returned HTTP {}", response.status);
                let results = CHECKS.iter().map(|name| TestResult::skipped(*name, &reason)).collect();
                return build_report(self, results, started);
            }
            Err(e) => {
                let reason = format!("Page could not be loaded: {e}");
                let results = CHECKS.iter().map(|name| TestResult::skipped(*name, &reason)).collect();
                return build_report(self, results, started);
            }
        };

        let results = vec![
            check_alt_text(&html),
            check_headings(&html),
            check_contrast(),
            check_keyboard(&html),
            check_aria(&html),
            check_form_labels(&html),
            check_landmarks(&html),
        ];

        build_report(self, results, started)
    }

    fn category_suggestions(&self, failed: &TestResult) -> Vec<String> {
        let hint = match failed.test_name.as_str() {
            "Image Alt Text" => "Add descriptive alt attributes to every <img> (empty alt for decorative images)",
            "Heading Hierarchy" => "Give the page a single <h1> describing its main content",
            "Form Labels" => "Associate each input with a <label for=...> or an aria-label",
            _ => return Vec::new(),
        };
        vec![hint.to_string()]
    }
}
