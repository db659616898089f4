use async_trait::async_trait;
use regex::Regex;
use std::time::Instant;
use tracing::info;

use super::{
    build_report, ProbeError, ProbeResponse, TestAgent, TestCategory, TestConfig, TestContext, TestReport,
    TestResult,
};
use crate::config::PerformanceThresholds;

lazy_static::lazy_static! {
    static ref SCRIPT: Regex = Regex::new(r"(?i)<script\b[^>]*\bsrc\s*=").unwrap();
    static ref STYLESHEET: Regex = Regex::new(r#"(?i)<link\b[^>]*rel\s*=\s*["']stylesheet["']"#).unwrap();
    static ref IMAGE: Regex = Regex::new(r"(?i)<img\b").unwrap();
}

const PAGE_CHECKS: &[&str] = &["HTML Size", "Caching Headers", "Compression", "Resource Count"];

pub struct PerformanceTestAgent;

impl PerformanceTestAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PerformanceTestAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn check_load_time(response: &ProbeResponse, limit_ms: u64) -> TestResult {
    let elapsed = response.elapsed.as_millis() as u64;
    if elapsed <= limit_ms {
        TestResult::passed("Load Time", format!("{elapsed}ms (limit {limit_ms}ms)"))
    } else {
        TestResult::failed("Load Time", format!("Page took {elapsed}ms to load (limit {limit_ms}ms)"))
    }
}

fn check_html_size(response: &ProbeResponse, limit: usize) -> TestResult {
    let size = response.body.len();
    if size <= limit {
        TestResult::passed("HTML Size", format!("{:.1}KB", size as f64 / 1024.0))
    } else {
        TestResult::failed(
            "HTML Size",
            format!("HTML is {:.1}KB (limit {:.1}KB)", size as f64 / 1024.0, limit as f64 / 1024.0),
        )
    }
}

fn check_caching(response: &ProbeResponse) -> TestResult {
    let present: Vec<&str> = ["cache-control", "etag", "last-modified"]
        .into_iter()
        .filter(|h| response.header(h).is_some())
        .collect();
    if present.is_empty() {
        TestResult::warning("Caching Headers", "No cache-control, etag or last-modified header")
    } else {
        TestResult::passed("Caching Headers", present.join(", "))
    }
}

fn check_compression(response: &ProbeResponse) -> TestResult {
    match response.header("content-encoding") {
        Some(encoding) if ["gzip", "br", "deflate", "zstd"].iter().any(|e| encoding.contains(e)) => {
            TestResult::passed("Compression", format!("content-encoding: {encoding}"))
        }
        _ => TestResult::warning("Compression", "Response is not compressed"),
    }
}

fn check_resources(response: &ProbeResponse, limit: usize) -> TestResult {
    let scripts = SCRIPT.find_iter(&response.body).count();
    let styles = STYLESHEET.find_iter(&response.body).count();
    let images = IMAGE.find_iter(&response.body).count();
    let total = scripts + styles + images;
    let details = format!("{total} resources ({scripts} scripts, {styles} stylesheets, {images} images)");
    if total <= limit {
        TestResult::passed("Resource Count", details)
    } else {
        TestResult::failed("Resource Count", format!("{details} exceeds limit of {limit}"))
    }
}

#[async_trait]
impl TestAgent for PerformanceTestAgent {
    fn name(&self) -> &str {
        "PerformanceTestAgent"
    }

    fn category(&self) -> TestCategory {
        TestCategory::Performance
    }

    async fn execute(&self, ctx: &TestContext, config: &TestConfig) -> TestReport {
        let started = Instant::now();
        let url = ctx.target_url(config);
        let thresholds: PerformanceThresholds = config.thresholds.unwrap_or(ctx.thresholds);
        info!(%url, ?thresholds, "running performance checks");

        let results = match ctx.probe.get(&url).await {
            Ok(response) => vec![
                check_load_time(&response, thresholds.max_load_time_ms),
                check_html_size(&response, thresholds.max_html_bytes),
                check_caching(&response),
                check_compression(&response),
                check_resources(&response, thresholds.max_resources),
            ],
            Err(e) => {
                // A timeout is a load-time failure; anything else means the
                // page never arrived to be measured.
                let load = match &e {
                    ProbeError::Timeout(_) => TestResult::failed("Load Time", e.to_string()),
                    _ => TestResult::skipped("Load Time", e.to_string()),
                };
                std::iter::once(load)
                    .chain(PAGE_CHECKS.iter().map(|name| TestResult::skipped(*name, "Page could not be loaded")))
                    .collect()
            }
        };

        build_report(self, results, started)
    }

    fn category_suggestions(&self, failed: &TestResult) -> Vec<String> {
        let hint = match failed.test_name.as_str() {
            "Load Time" => "Reduce blocking work on startup and lazy-load heavy components",
            "HTML Size" => "Move inline data and markup into components loaded on demand",
            "Resource Count" => "Bundle scripts and styles and lazy-load below-the-fold images",
            _ => return Vec::new(),
        };
        vec![hint.to_string()]
    }
}
