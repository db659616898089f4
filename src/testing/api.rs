use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::info;

use super::{
    build_report, ApiEndpoint, TestAgent, TestCategory, TestConfig, TestContext, TestReport, TestResult,
};

/// Requested to confirm unknown routes come back as 404.
const NONEXISTENT_PATH: &str = "/api/__nonexistent_route_404_check__";

/// Probed when a test action declares no endpoints.
const DEFAULT_ENDPOINT: &str = "/api/health";

pub struct ApiTestAgent;

impl ApiTestAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ApiTestAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn endpoint_test_name(endpoint: &ApiEndpoint) -> String {
    format!("Endpoint {} {}", endpoint.method.to_uppercase(), endpoint.path)
}

async fn check_endpoint(ctx: &TestContext, base: &str, endpoint: &ApiEndpoint) -> (TestResult, Option<Duration>) {
    let name = endpoint_test_name(endpoint);
    let url = format!("{}{}", base, endpoint.path);

    match ctx.probe.send(&endpoint.method, &url).await {
        Ok(response) => {
            let ok = match endpoint.expected_status {
                Some(expected) => response.status == expected,
                None => response.status < 400,
            };
            let result = if ok {
                TestResult::passed(&name, format!("HTTP {} in {}ms", response.status, response.elapsed.as_millis()))
            } else {
                let expected = endpoint
                    .expected_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "< 400".to_string());
                TestResult::failed(&name, format!("HTTP {} (expected {})", response.status, expected))
            };
            (result, Some(response.elapsed))
        }
        Err(e) => (TestResult::failed(&name, e.to_string()), None),
    }
}

fn check_response_times(timings: &[Duration], threshold_ms: u64) -> TestResult {
    if timings.is_empty() {
        return TestResult::skipped("Response Time", "No endpoint responded");
    }

    let total: u128 = timings.iter().map(|d| d.as_millis()).sum();
    let average = (total / timings.len() as u128) as u64;
    if average <= threshold_ms {
        TestResult::passed("Response Time", format!("Average {average}ms (limit {threshold_ms}ms)"))
    } else {
        TestResult::failed(
            "Response Time",
            format!("Average response time {average}ms exceeds {threshold_ms}ms"),
        )
    }
}

async fn check_not_found(ctx: &TestContext, base: &str) -> TestResult {
    let url = format!("{base}{NONEXISTENT_PATH}");
    match ctx.probe.get(&url).await {
        Ok(response) if response.status == 404 => {
            TestResult::passed("404 Handling", "Unknown routes return 404")
        }
        Ok(response) => TestResult::failed(
            "404 Handling",
            format!("Unknown route returned HTTP {} instead of 404", response.status),
        ),
        Err(e) => TestResult::skipped("404 Handling", format!("Could not reach server: {e}")),
    }
}

#[async_trait]
impl TestAgent for ApiTestAgent {
    fn name(&self) -> &str {
        "ApiTestAgent"
    }

    fn category(&self) -> TestCategory {
        TestCategory::Api
    }

    async fn execute(&self, ctx: &TestContext, config: &TestConfig) -> TestReport {
        let started = Instant::now();
        let base = ctx.target_url(config);

        let endpoints = if config.endpoints.is_empty() {
            vec![ApiEndpoint::get(DEFAULT_ENDPOINT)]
        } else {
            config.endpoints.clone()
        };
        info!(%base, endpoints = endpoints.len(), "running api checks");

        let mut results = Vec::with_capacity(endpoints.len() + 2);
        let mut timings = Vec::new();
        for endpoint in &endpoints {
            let (result, elapsed) = check_endpoint(ctx, &base, endpoint).await;
            results.push(result);
            timings.extend(elapsed);
        }

        results.push(check_response_times(&timings, ctx.api_response_time_ms));
        results.push(check_not_found(ctx, &base).await);

        build_report(self, results, started)
    }

    fn category_suggestions(&self, failed: &TestResult) -> Vec<String> {
        let hint = match failed.test_name.as_str() {
            name if name.starts_with("Endpoint ") => {
                "Verify the route is registered and the backend server is running"
            }
            "Response Time" => "Add caching or move slow work out of the request handlers",
            "404 Handling" => "Add a catch-all handler that returns 404 for unknown API routes",
            _ => return Vec::new(),
        };
        vec![hint.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceThresholds;
    use crate::testing::{ProbeError, StaticProbe, TestStatus};
    use std::sync::Arc;

    const BASE: &str = "http://localhost:3000";

    fn context(probe: StaticProbe) -> TestContext {
        TestContext {
            preview_url: BASE.to_string(),
            probe: Arc::new(probe),
            thresholds: PerformanceThresholds::default(),
            api_response_time_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_healthy_api() {
        let probe = StaticProbe::new()
            .page("http://localhost:3000/api/users", 200, "[]")
            .respond("POST", "http://localhost:3000/api/users", 201, &[], "{}", Duration::from_millis(40))
            .page(&format!("{BASE}{NONEXISTENT_PATH}"), 404, "");
        let config = TestConfig {
            endpoints: vec![
                ApiEndpoint::get("/api/users"),
                ApiEndpoint {
                    path: "/api/users".to_string(),
                    method: "POST".to_string(),
                    expected_status: Some(201),
                },
            ],
            ..TestConfig::default()
        };

        let report = ApiTestAgent::new().execute(&context(probe), &config).await;

        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.failed, 0);
        assert!(report.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_slow_and_missing_endpoints() {
        let probe = StaticProbe::new()
            .respond("GET", "http://localhost:3000/api/slow", 200, &[], "{}", Duration::from_millis(2500))
            .fail("GET", "http://localhost:3000/api/down", ProbeError::Timeout("down".to_string()))
            .page(&format!("{BASE}{NONEXISTENT_PATH}"), 200, "<html>spa</html>");
        let config = TestConfig {
            endpoints: vec![ApiEndpoint::get("/api/slow"), ApiEndpoint::get("/api/down")],
            ..TestConfig::default()
        };

        let report = ApiTestAgent::new().execute(&context(probe), &config).await;

        let status_of = |name: &str| report.results.iter().find(|r| r.test_name == name).unwrap().status;
        assert_eq!(status_of("Endpoint GET /api/slow"), TestStatus::Passed);
        assert_eq!(status_of("Endpoint GET /api/down"), TestStatus::Failed);
        assert_eq!(status_of("Response Time"), TestStatus::Failed);
        assert_eq!(status_of("404 Handling"), TestStatus::Failed);
        assert!(report.suggestions.iter().any(|s| s.contains("responding in time")));
        assert!(report.suggestions.iter().any(|s| s.contains("catch-all handler")));
    }

    #[tokio::test]
    async fn test_no_endpoints_probes_health_route() {
        let report = ApiTestAgent::new()
            .execute(&context(StaticProbe::new()), &TestConfig::default())
            .await;

        assert_eq!(report.results[0].test_name, "Endpoint GET /api/health");
        assert_eq!(report.results[1].status, TestStatus::Skipped);
        assert_eq!(report.results[2].status, TestStatus::Skipped);
    }
}
