use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::accessibility::AccessibilityTestAgent;
use super::api::ApiTestAgent;
use super::browser::BrowserTestAgent;
use super::performance::PerformanceTestAgent;
use super::{TestAgent, TestContext, TestReport};
use crate::actions::{Action, ActionDeclaration};
use crate::events::{AlertKind, AlertSource, EventSink, RunnerEvent};
use crate::intelligence::TestFeedback;

/// Registration order is dispatch priority.
pub fn default_agents() -> Vec<Arc<dyn TestAgent>> {
    vec![
        Arc::new(BrowserTestAgent::new()),
        Arc::new(ApiTestAgent::new()),
        Arc::new(AccessibilityTestAgent::new()),
        Arc::new(PerformanceTestAgent::new()),
    ]
}

/// Message id stamped on feedback actions synthesized from test reports.
const FEEDBACK_MESSAGE_ID: &str = "test-runner";

pub struct TestRunner {
    agents: Vec<Arc<dyn TestAgent>>,
    initialized: OnceCell<()>,
    context: TestContext,
    reports: Mutex<HashMap<String, TestReport>>,
    events: EventSink,
}

impl TestRunner {
    pub fn new(context: TestContext, events: EventSink) -> Self {
        Self::with_agents(context, events, default_agents())
    }

    pub fn with_agents(context: TestContext, events: EventSink, agents: Vec<Arc<dyn TestAgent>>) -> Self {
        Self {
            agents,
            initialized: OnceCell::new(),
            context,
            reports: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Agent initialization runs once, before the first dispatch. An agent
    /// that fails to initialize stays registered.
    async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                for agent in &self.agents {
                    if let Err(e) = agent.initialize().await {
                        warn!(agent = agent.name(), "test agent failed to initialize: {:#}", e);
                    }
                }
                info!(agents = self.agents.len(), "test agents initialized");
            })
            .await;
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    /// Run a `test` action with the first agent that accepts it, store the
    /// report and synthesize a feedback action from it.
    pub async fn run_test_action(&self, action_id: &str, action: &Action) -> Result<TestReport> {
        let Action::Test { test_type, config, .. } = action else {
            bail!("action {action_id} is not a test action");
        };

        self.ensure_initialized().await;

        let Some(agent) = self.agents.iter().find(|a| a.can_handle(action)) else {
            bail!("No test agent available for {test_type} tests");
        };

        info!(action_id, agent = agent.name(), "running {} tests", test_type);
        self.events.alert(
            AlertKind::Info,
            format!("Running {test_type} tests"),
            format!("{} started", agent.name()),
            "",
            AlertSource::Test,
        );

        let report = agent.execute(&self.context, config).await;
        self.announce(&report);

        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(action_id.to_string(), report.clone());

        self.events.emit(RunnerEvent::TestCompleted {
            action_id: action_id.to_string(),
            report: report.clone(),
        });
        self.events.emit(RunnerEvent::Feedback(ActionDeclaration {
            action_id: format!("{action_id}-feedback"),
            message_id: FEEDBACK_MESSAGE_ID.to_string(),
            action: Action::Feedback {
                content: format!(
                    "{}\n\n{}",
                    TestFeedback::format_for_llm(&report),
                    TestFeedback::format_for_message(&report)
                ),
            },
        }));

        Ok(report)
    }

    fn announce(&self, report: &TestReport) {
        let summary = TestFeedback::summary(report);
        if report.summary.failed > 0 {
            let mut content: Vec<String> = report
                .failed_results()
                .map(|r| format!("❌ {}: {}", r.test_name, r.error.as_deref().unwrap_or_default()))
                .collect();
            content.extend(report.suggestions.iter().map(|s| format!("💡 {s}")));
            self.events.alert(
                AlertKind::Error,
                format!("{} failed test(s)", report.summary.failed),
                summary,
                content.join("\n"),
                AlertSource::Test,
            );
        } else {
            self.events.alert(
                AlertKind::Success,
                "All tests passed",
                summary,
                "",
                AlertSource::Test,
            );
        }
    }

    pub fn report(&self, action_id: &str) -> Option<TestReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(action_id)
            .cloned()
    }

    pub fn reports(&self) -> HashMap<String, TestReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceThresholds;
    use crate::events::ActionAlert;
    use crate::intelligence::test_feedback::TEST_RESULTS_OPEN;
    use crate::testing::{build_report, StaticProbe, TestCategory, TestConfig, TestResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FixedAgent {
        name: &'static str,
        category: TestCategory,
        fail: bool,
        inits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TestAgent for FixedAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> TestCategory {
            self.category
        }

        async fn initialize(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&self, _ctx: &TestContext, _config: &TestConfig) -> TestReport {
            let mut results = vec![TestResult::passed("Page Load", "ok")];
            if self.fail {
                results.push(TestResult::failed("Broken Links", "HTTP 404"));
            }
            build_report(self, results, Instant::now())
        }
    }

    fn agent(name: &'static str, category: TestCategory, fail: bool, inits: &Arc<AtomicUsize>) -> Arc<dyn TestAgent> {
        Arc::new(FixedAgent {
            name,
            category,
            fail,
            inits: inits.clone(),
        })
    }

    fn runner(agents: Vec<Arc<dyn TestAgent>>) -> (TestRunner, UnboundedReceiver<RunnerEvent>) {
        let context = TestContext {
            preview_url: "http://localhost:5173".to_string(),
            probe: Arc::new(StaticProbe::new()),
            thresholds: PerformanceThresholds::default(),
            api_response_time_ms: 1000,
        };
        let (events, rx) = EventSink::channel();
        (TestRunner::with_agents(context, events, agents), rx)
    }

    fn test_action(test_type: TestCategory) -> Action {
        Action::Test {
            test_type,
            content: String::new(),
            config: TestConfig::default(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn alerts(events: &[RunnerEvent]) -> Vec<&ActionAlert> {
        events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Alert(alert) => Some(alert),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_capable_agent_wins() {
        let inits = Arc::new(AtomicUsize::new(0));
        let (runner, _rx) = runner(vec![
            agent("First", TestCategory::Browser, false, &inits),
            agent("Second", TestCategory::Browser, false, &inits),
        ]);

        let report = runner.run_test_action("t1", &test_action(TestCategory::Browser)).await.unwrap();

        assert_eq!(report.agent_name, "First");
        assert_eq!(runner.report("t1").unwrap(), report);
    }

    #[tokio::test]
    async fn test_agents_initialize_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let (runner, _rx) = runner(vec![
            agent("Browser", TestCategory::Browser, false, &inits),
            agent("Api", TestCategory::Api, false, &inits),
        ]);

        runner.run_test_action("a", &test_action(TestCategory::Browser)).await.unwrap();
        runner.run_test_action("b", &test_action(TestCategory::Api)).await.unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(runner.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_emits_error_alert_and_feedback() {
        let inits = Arc::new(AtomicUsize::new(0));
        let (runner, mut rx) = runner(vec![agent("Browser", TestCategory::Browser, true, &inits)]);

        runner.run_test_action("t1", &test_action(TestCategory::Browser)).await.unwrap();
        let events = drain(&mut rx);

        let kinds: Vec<AlertKind> = alerts(&events).iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Info, AlertKind::Error]);
        assert!(alerts(&events)[1].content.contains("Broken Links"));

        assert!(events
            .iter()
            .any(|e| matches!(e, RunnerEvent::TestCompleted { action_id, .. } if action_id == "t1")));
        let feedback = events
            .iter()
            .find_map(|e| match e {
                RunnerEvent::Feedback(declaration) => Some(declaration),
                _ => None,
            })
            .unwrap();
        assert_eq!(feedback.action_id, "t1-feedback");
        let Action::Feedback { content } = &feedback.action else {
            panic!("expected a feedback action");
        };
        assert!(content.contains(TEST_RESULTS_OPEN));
        assert_eq!(TestFeedback::parse_test_results(content).unwrap().summary.failed, 1);
    }

    #[tokio::test]
    async fn test_success_still_synthesizes_feedback() {
        let inits = Arc::new(AtomicUsize::new(0));
        let (runner, mut rx) = runner(vec![agent("Browser", TestCategory::Browser, false, &inits)]);

        runner.run_test_action("ok", &test_action(TestCategory::Browser)).await.unwrap();
        let events = drain(&mut rx);

        let kinds: Vec<AlertKind> = alerts(&events).iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Info, AlertKind::Success]);
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::Feedback(_))));
    }

    #[tokio::test]
    async fn test_no_capable_agent_is_an_error() {
        let inits = Arc::new(AtomicUsize::new(0));
        let (runner, _rx) = runner(vec![agent("Browser", TestCategory::Browser, false, &inits)]);

        let err = runner
            .run_test_action("x", &test_action(TestCategory::Performance))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("performance"));
        assert!(runner.report("x").is_none());
    }

    #[test]
    fn test_default_registration_order() {
        let names: Vec<String> = default_agents().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(
            names,
            ["BrowserTestAgent", "ApiTestAgent", "AccessibilityTestAgent", "PerformanceTestAgent"]
        );
    }
}
