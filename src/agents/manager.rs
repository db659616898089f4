use anyhow::anyhow;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BackendSubagent, DelegationStatus, FrontendSubagent, Subagent, SubagentResult, SubagentTask, TaskDelegation,
    TaskPriority,
};
use crate::config::SubagentConfig;
use crate::sandbox::Sandbox;

const MANAGER_NAME: &str = "SubagentManager";

/// A built-in subagent, constructed against the sandbox it writes into.
pub struct SubagentEntry {
    pub name: &'static str,
    pub factory: fn(Arc<dyn Sandbox>) -> Arc<dyn Subagent>,
}

pub fn default_subagents() -> Vec<SubagentEntry> {
    vec![
        SubagentEntry {
            name: "BackendSubagent",
            factory: |sandbox| Arc::new(BackendSubagent::new(sandbox)) as Arc<dyn Subagent>,
        },
        SubagentEntry {
            name: "FrontendSubagent",
            factory: |sandbox| Arc::new(FrontendSubagent::new(sandbox)) as Arc<dyn Subagent>,
        },
    ]
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub completed: usize,
    pub succeeded: usize,
    pub success_rate: f64,
}

struct ActiveDelegation {
    delegation: TaskDelegation,
    cancel: CancellationToken,
    seq: u64,
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, ActiveDelegation>,
    completed: Vec<TaskDelegation>,
    next_seq: u64,
}

impl ManagerState {
    fn is_busy(&self, agent: &str) -> bool {
        self.active.values().any(|a| a.delegation.agent == agent)
    }

    fn stats(&self, agent: &str) -> AgentStats {
        let history: Vec<&TaskDelegation> = self.completed.iter().filter(|d| d.agent == agent).collect();
        let succeeded = history
            .iter()
            .filter(|d| d.status == DelegationStatus::Completed)
            .count();
        let success_rate = if history.is_empty() {
            0.0
        } else {
            succeeded as f64 / history.len() as f64
        };
        AgentStats {
            completed: history.len(),
            succeeded,
            success_rate,
        }
    }

    fn score(&self, agent: &dyn Subagent, task: &SubagentTask) -> f64 {
        let mut score = 100.0;
        if self.is_busy(agent.name()) {
            score -= 20.0;
        }
        score += self.stats(agent.name()).success_rate * 20.0;
        score += match task.priority {
            TaskPriority::Critical => 30.0,
            TaskPriority::High => 20.0,
            TaskPriority::Medium | TaskPriority::Low => 0.0,
        };
        score
    }
}

/// Routes tasks to the best capable subagent and keeps the delegation
/// records. Each delegation lives in the active map until it finishes or
/// is cancelled, then moves to the completed list exactly once.
pub struct SubagentManager {
    agents: Vec<Arc<dyn Subagent>>,
    max_concurrent_tasks: usize,
    initialized: OnceCell<()>,
    state: Mutex<ManagerState>,
}

impl SubagentManager {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            agents: Vec::new(),
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            initialized: OnceCell::new(),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn from_config(config: &SubagentConfig) -> Self {
        Self::new(config.max_concurrent_tasks)
    }

    /// A manager with the built-in subagents registered.
    pub fn with_defaults(sandbox: Arc<dyn Sandbox>, config: &SubagentConfig) -> Self {
        let mut manager = Self::from_config(config);
        for entry in default_subagents() {
            debug!(agent = entry.name, "registering subagent");
            manager.register((entry.factory)(sandbox.clone()));
        }
        manager
    }

    /// Register an agent. Replaces one already registered under the same name.
    pub fn register(&mut self, agent: Arc<dyn Subagent>) {
        match self.agents.iter().position(|a| a.name() == agent.name()) {
            Some(idx) => self.agents[idx] = agent,
            None => self.agents.push(agent),
        }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                for agent in &self.agents {
                    if let Err(e) = agent.initialize().await {
                        warn!(agent = agent.name(), "subagent failed to initialize: {:#}", e);
                    }
                }
            })
            .await;
    }

    /// Current score of `agent` for `task`.
    pub fn score_agent(&self, agent: &dyn Subagent, task: &SubagentTask) -> f64 {
        self.state().score(agent, task)
    }

    fn select_agent(&self, state: &ManagerState, task: &SubagentTask) -> Option<Arc<dyn Subagent>> {
        let mut best: Option<(f64, &Arc<dyn Subagent>)> = None;
        for agent in self.agents.iter().filter(|a| a.can_handle(task)) {
            let score = state.score(agent.as_ref(), task);
            debug!(agent = agent.name(), task_id = %task.id, score, "scored subagent");
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, agent));
            }
        }
        best.map(|(_, agent)| agent.clone())
    }

    /// Run `task` on the best capable agent. Never fails: every problem,
    /// including a missing agent, comes back as an unsuccessful result.
    pub async fn delegate_task(&self, task: SubagentTask) -> SubagentResult {
        self.initialize().await;

        let (agent, cancel, seq) = {
            let mut state = self.state();
            if state.active.contains_key(&task.id) {
                warn!(task_id = %task.id, "task is already running");
                return SubagentResult::failure(
                    &task.id,
                    MANAGER_NAME,
                    vec![format!("Task {} is already running", task.id)],
                );
            }
            let Some(agent) = self.select_agent(&state, &task) else {
                warn!(task_id = %task.id, task_type = %task.task_type, "no subagent can handle task");
                return SubagentResult::failure(
                    &task.id,
                    MANAGER_NAME,
                    vec![format!("No suitable agent found for task type {}", task.task_type)],
                );
            };

            let cancel = CancellationToken::new();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.active.insert(
                task.id.clone(),
                ActiveDelegation {
                    delegation: TaskDelegation {
                        task: task.clone(),
                        agent: agent.name().to_string(),
                        status: DelegationStatus::Running,
                        result: None,
                        start_time: Some(Utc::now()),
                        end_time: None,
                    },
                    cancel: cancel.clone(),
                    seq,
                },
            );
            (agent, cancel, seq)
        };

        info!(task_id = %task.id, agent = agent.name(), "delegating task");
        let started = Instant::now();
        let run = async {
            match task.timeout {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), agent.execute(&task))
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("Task timed out after {ms}ms"))),
                None => agent.execute(&task).await,
            }
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("Task cancelled")),
            outcome = run => outcome,
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task.id, agent = agent.name(), "task failed: {:#}", e);
                SubagentResult::failure(&task.id, agent.name(), vec![e.to_string()])
            }
        };
        result.duration = Some(started.elapsed().as_millis() as u64);
        self.finish(&task.id, seq, &result);
        result
    }

    /// Delegate in chunks of `max_concurrent_tasks`; a chunk starts only
    /// after the previous one has fully finished. Results keep input order.
    pub async fn delegate_tasks(&self, tasks: Vec<SubagentTask>) -> Vec<SubagentResult> {
        let mut results = Vec::with_capacity(tasks.len());
        for chunk in tasks.chunks(self.max_concurrent_tasks) {
            let chunk_results = join_all(chunk.iter().cloned().map(|task| self.delegate_task(task))).await;
            results.extend(chunk_results);
        }
        results
    }

    fn finish(&self, task_id: &str, seq: u64, result: &SubagentResult) {
        let mut state = self.state();
        // Cancelled delegations were already moved by cancel_task.
        if state.active.get(task_id).map_or(true, |a| a.seq != seq) {
            return;
        }
        if let Some(entry) = state.active.remove(task_id) {
            let mut delegation = entry.delegation;
            delegation.status = if result.success {
                DelegationStatus::Completed
            } else {
                DelegationStatus::Failed
            };
            delegation.result = Some(result.clone());
            delegation.end_time = Some(Utc::now());
            state.completed.push(delegation);
        }
    }

    /// Cancel an active task. Returns false once the task has finished.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.state();
        let Some(entry) = state.active.remove(task_id) else {
            return false;
        };
        entry.cancel.cancel();
        let mut delegation = entry.delegation;
        delegation.status = DelegationStatus::Failed;
        delegation.end_time = Some(Utc::now());
        info!(task_id, agent = %delegation.agent, "task cancelled");
        state.completed.push(delegation);
        true
    }

    pub fn active_delegations(&self) -> Vec<TaskDelegation> {
        self.state().active.values().map(|a| a.delegation.clone()).collect()
    }

    pub fn completed_delegations(&self) -> Vec<TaskDelegation> {
        self.state().completed.clone()
    }

    /// The delegation for `task_id`, active first, then the latest completed.
    pub fn delegation(&self, task_id: &str) -> Option<TaskDelegation> {
        let state = self.state();
        if let Some(active) = state.active.get(task_id) {
            return Some(active.delegation.clone());
        }
        state.completed.iter().rev().find(|d| d.task.id == task_id).cloned()
    }

    pub fn agent_stats(&self, agent: &str) -> AgentStats {
        self.state().stats(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentCapabilities;
    use crate::sandbox::MemorySandbox;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAgent {
        name: &'static str,
        capabilities: AgentCapabilities,
        delay: Duration,
        fail: bool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl StubAgent {
        fn new(name: &'static str, task_types: &[&str]) -> Self {
            Self {
                name,
                capabilities: AgentCapabilities::new(task_types, &[]),
                delay: Duration::ZERO,
                fail: false,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Subagent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &AgentCapabilities {
            &self.capabilities
        }

        async fn execute(&self, task: &SubagentTask) -> Result<SubagentResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("generator crashed"));
            }
            Ok(SubagentResult::success(&task.id, self.name, "done"))
        }
    }

    fn delegation(task_id: &str, agent: &str, status: DelegationStatus) -> TaskDelegation {
        TaskDelegation {
            task: SubagentTask::new(task_id, "backend", "history"),
            agent: agent.to_string(),
            status,
            result: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_load_and_reliability_factors() {
        let mut manager = SubagentManager::new(5);
        let idle = Arc::new(StubAgent::new("idle", &["backend"]));
        let busy = Arc::new(StubAgent::new("busy", &["backend"]));
        manager.register(idle.clone());
        manager.register(busy.clone());

        {
            let mut state = manager.state();
            state.completed.push(delegation("old", "busy", DelegationStatus::Completed));
            state.active.insert(
                "running".to_string(),
                ActiveDelegation {
                    delegation: delegation("running", "busy", DelegationStatus::Running),
                    cancel: CancellationToken::new(),
                    seq: 99,
                },
            );
        }

        let task = SubagentTask::new("t", "backend", "Todo API");
        // 100 - 20 (busy) + 1.0 * 20 (history) against a plain 100.
        assert_eq!(manager.score_agent(idle.as_ref(), &task), 100.0);
        assert_eq!(manager.score_agent(busy.as_ref(), &task), 100.0);

        let state = manager.state();
        let picked = manager.select_agent(&state, &task).unwrap();
        assert_eq!(picked.name(), "idle");
    }

    #[test]
    fn test_each_factor_moves_score_by_twenty() {
        let mut manager = SubagentManager::new(5);
        let busy = Arc::new(StubAgent::new("busy", &["backend"]));
        let reliable = Arc::new(StubAgent::new("reliable", &["backend"]));
        let halfway = Arc::new(StubAgent::new("halfway", &["backend"]));
        manager.register(busy.clone());
        manager.register(reliable.clone());
        manager.register(halfway.clone());

        {
            let mut state = manager.state();
            state.active.insert(
                "running".to_string(),
                ActiveDelegation {
                    delegation: delegation("running", "busy", DelegationStatus::Running),
                    cancel: CancellationToken::new(),
                    seq: 7,
                },
            );
            state.completed.push(delegation("a", "reliable", DelegationStatus::Completed));
            state.completed.push(delegation("b", "reliable", DelegationStatus::Completed));
            state.completed.push(delegation("c", "halfway", DelegationStatus::Completed));
            state.completed.push(delegation("d", "halfway", DelegationStatus::Failed));
        }

        let task = SubagentTask::new("t", "backend", "Todo API");
        assert_eq!(manager.score_agent(busy.as_ref(), &task), 80.0);
        assert_eq!(manager.score_agent(reliable.as_ref(), &task), 120.0);
        assert_eq!(manager.score_agent(halfway.as_ref(), &task), 110.0);

        let state = manager.state();
        assert_eq!(manager.select_agent(&state, &task).unwrap().name(), "reliable");
    }

    #[test]
    fn test_priority_boost() {
        let manager = SubagentManager::new(5);
        let agent = StubAgent::new("a", &["backend"]);
        let mut task = SubagentTask::new("t", "backend", "Todo API");

        task.priority = TaskPriority::Critical;
        assert_eq!(manager.score_agent(&agent, &task), 130.0);
        task.priority = TaskPriority::High;
        assert_eq!(manager.score_agent(&agent, &task), 120.0);
        task.priority = TaskPriority::Low;
        assert_eq!(manager.score_agent(&agent, &task), 100.0);
    }

    #[test]
    fn test_better_history_wins() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(StubAgent::new("flaky", &["backend"])));
        manager.register(Arc::new(StubAgent::new("steady", &["backend"])));
        {
            let mut state = manager.state();
            state.completed.push(delegation("a", "flaky", DelegationStatus::Failed));
            state.completed.push(delegation("b", "steady", DelegationStatus::Completed));
        }

        let state = manager.state();
        let picked = manager.select_agent(&state, &SubagentTask::new("t", "backend", "x")).unwrap();
        assert_eq!(picked.name(), "steady");
    }

    #[tokio::test]
    async fn test_successful_delegation_moves_to_completed() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(StubAgent::new("builder", &["backend"])));

        let result = manager.delegate_task(SubagentTask::new("t1", "backend", "Todo API")).await;

        assert!(result.success);
        assert!(result.duration.is_some());
        assert!(manager.active_delegations().is_empty());
        let completed = manager.completed_delegations();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, DelegationStatus::Completed);
        assert!(completed[0].end_time.is_some());
        assert_eq!(manager.agent_stats("builder").success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_no_capable_agent() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(StubAgent::new("builder", &["backend"])));
        let mut task = SubagentTask::new("t1", "mobile", "iOS app");
        task.priority = TaskPriority::Critical;

        let result = manager.delegate_task(task).await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["No suitable agent found for task type mobile".to_string()]);
        assert!(manager.completed_delegations().is_empty());
    }

    #[tokio::test]
    async fn test_agent_error_becomes_failed_result() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(StubAgent::new("builder", &["backend"]).failing()));

        let result = manager.delegate_task(SubagentTask::new("t1", "backend", "Todo API")).await;

        assert!(!result.success);
        assert_eq!(result.agent_name, "builder");
        assert_eq!(result.errors, vec!["generator crashed".to_string()]);
        assert_eq!(manager.delegation("t1").unwrap().status, DelegationStatus::Failed);
        assert_eq!(manager.agent_stats("builder").succeeded, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(
            StubAgent::new("slow", &["backend"]).delay(Duration::from_secs(30)),
        ));
        let mut task = SubagentTask::new("t1", "backend", "Todo API");
        task.timeout = Some(20);

        let result = manager.delegate_task(task).await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["Task timed out after 20ms".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(
            StubAgent::new("slow", &["backend"]).delay(Duration::from_secs(30)),
        ));
        let manager = Arc::new(manager);

        let handle = tokio::spawn({
            let manager = manager.clone();
            async move { manager.delegate_task(SubagentTask::new("t1", "backend", "Todo API")).await }
        });
        while manager.active_delegations().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(manager.cancel_task("t1"));
        let result = handle.await.unwrap();
        assert_eq!(result.errors, vec!["Task cancelled".to_string()]);
        assert!(!manager.cancel_task("t1"));

        let completed = manager.completed_delegations();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, DelegationStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_active_task_is_rejected() {
        let mut manager = SubagentManager::new(5);
        manager.register(Arc::new(
            StubAgent::new("slow", &["backend"]).delay(Duration::from_millis(100)),
        ));

        let results = manager
            .delegate_tasks(vec![
                SubagentTask::new("same", "backend", "Todo API"),
                SubagentTask::new("same", "backend", "Todo API"),
            ])
            .await;

        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].errors[0].contains("already running"));
        assert_eq!(manager.completed_delegations().len(), 1);
    }

    #[tokio::test]
    async fn test_chunks_bound_concurrency() {
        let agent = StubAgent::new("worker", &["backend"]).delay(Duration::from_millis(30));
        let peak = agent.peak.clone();
        let mut manager = SubagentManager::new(2);
        manager.register(Arc::new(agent));

        let tasks = (0..5)
            .map(|i| SubagentTask::new(format!("t{i}"), "backend", "Todo API"))
            .collect();
        let results = manager.delegate_tasks(tasks).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, ["t0", "t1", "t2", "t3", "t4"]);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_default_subagents_route_by_type() {
        let sandbox = Arc::new(MemorySandbox::new());
        let manager = SubagentManager::with_defaults(sandbox.clone(), &SubagentConfig::default());
        assert_eq!(manager.agent_names(), ["BackendSubagent", "FrontendSubagent"]);

        let results = manager
            .delegate_tasks(vec![
                SubagentTask::new("api", "backend", "Build an API for orders"),
                SubagentTask::new("ui", "ui", "Create an order summary"),
            ])
            .await;

        assert_eq!(results[0].agent_name, "BackendSubagent");
        assert_eq!(results[1].agent_name, "FrontendSubagent");
        assert!(sandbox.file("backend/routes/orders.js").is_some());
        assert!(sandbox.file("src/components/OrderSummary.tsx").is_some());
    }
}
