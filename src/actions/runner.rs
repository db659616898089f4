use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::background::{DetachedFailure, DetachedTasks};
use super::{
    Action, ActionCommandError, ActionDeclaration, ActionError, ActionState, ActionStatus, PreconditionError,
    SupabaseOperation,
};
use crate::config::RunnerConfig;
use crate::events::{
    AlertKind, AlertSource, DeployAlert, DeployStage, EventSink, RunnerEvent, StageStatus, SupabaseAlert,
};
use crate::intelligence::ErrorMonitor;
use crate::sandbox::{parent_dir, relative_path, shell_args, Sandbox, SandboxError, SandboxProcess};
use crate::testing::{HttpProbe, TestCategory, TestConfig, TestContext, TestRunner};

/// Output kept from a long-running process, newest bytes win.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Where the last successful build put its artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    pub path: String,
    pub exit_code: i32,
    pub output: String,
}

enum Job {
    MarkRunning(String),
    Execute {
        action_id: String,
        streaming: bool,
        done: oneshot::Sender<ActionStatus>,
    },
    Barrier(oneshot::Sender<()>),
}

/// How a successfully dispatched action leaves its status.
enum Settled {
    Complete,
    /// Partial file content was written; the final run completes it.
    Streaming,
    /// Handed to someone outside the runner to confirm.
    AwaitingConfirmation,
}

enum Submission {
    Skipped(ActionStatus),
    Queued(oneshot::Receiver<ActionStatus>),
}

struct RunnerInner {
    sandbox: Arc<dyn Sandbox>,
    config: RunnerConfig,
    actions: Mutex<HashMap<String, ActionState>>,
    events: EventSink,
    monitor: Arc<ErrorMonitor>,
    probe: Arc<dyn HttpProbe>,
    test_runner: OnceLock<TestRunner>,
    build_output: Mutex<Option<BuildOutput>>,
    detached: DetachedTasks,
    jobs: mpsc::WeakUnboundedSender<Job>,
}

/// Executes actions against one sandbox, one at a time, in submission order.
/// `start` actions hand their process to a detached task and let the queue
/// move on after a settle delay.
pub struct ActionRunner {
    inner: Arc<RunnerInner>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ActionRunner {
    /// Must be called inside a tokio runtime; the queue worker is spawned
    /// here and stops once the runner is dropped and the queue drains.
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        config: RunnerConfig,
        probe: Arc<dyn HttpProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (events, event_rx) = EventSink::channel();
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (detached, failures) = DetachedTasks::new();

        let monitor = Arc::new(ErrorMonitor::new(sandbox.workdir()));
        monitor.init();

        let inner = Arc::new(RunnerInner {
            sandbox,
            config,
            actions: Mutex::new(HashMap::new()),
            events: events.clone(),
            monitor,
            probe,
            test_runner: OnceLock::new(),
            build_output: Mutex::new(None),
            detached,
            jobs: jobs.downgrade(),
        });

        tokio::spawn(run_queue(inner.clone(), job_rx));
        tokio::spawn(forward_detached_failures(failures, events));

        (Self { inner, jobs }, event_rx)
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| anyhow!("action queue stopped"))
    }

    /// Register an action as pending. Known ids are ignored; returns whether
    /// the action was new.
    pub fn add_action(&self, action_id: &str, action: Action) -> bool {
        {
            let mut actions = self.inner.actions();
            if actions.contains_key(action_id) {
                debug!(action_id, "action already registered");
                return false;
            }
            actions.insert(action_id.to_string(), ActionState::new(action));
        }

        self.inner.events.emit(RunnerEvent::StatusChanged {
            action_id: action_id.to_string(),
            status: ActionStatus::Pending,
        });
        if let Err(e) = self.send(Job::MarkRunning(action_id.to_string())) {
            warn!(action_id, "{}", e);
        }
        true
    }

    /// Queue an action for execution and resolve with its status once it ran.
    ///
    /// The action is queued before this returns, so queue order is call
    /// order. Streaming calls only update `file` actions; an action that
    /// already ran resolves immediately with its current status.
    pub fn run_action(
        &self,
        action_id: &str,
        action: Action,
        is_streaming: bool,
    ) -> impl Future<Output = Result<ActionStatus>> + Send + 'static {
        let submission = self.submit(action_id, action, is_streaming);
        async move {
            match submission? {
                Submission::Skipped(status) => Ok(status),
                Submission::Queued(done) => done.await.map_err(|_| anyhow!("action queue stopped")),
            }
        }
    }

    fn submit(&self, action_id: &str, action: Action, is_streaming: bool) -> Result<Submission> {
        let mut actions = self.inner.actions();
        let Some(state) = actions.get_mut(action_id) else {
            bail!("unknown action {action_id}");
        };

        if state.executed {
            return Ok(Submission::Skipped(state.status.clone()));
        }
        if is_streaming && !matches!(action, Action::File { .. }) {
            return Ok(Submission::Skipped(state.status.clone()));
        }

        state.action = action;
        state.executed = !is_streaming;

        let (done, rx) = oneshot::channel();
        self.send(Job::Execute {
            action_id: action_id.to_string(),
            streaming: is_streaming,
            done,
        })?;
        Ok(Submission::Queued(rx))
    }

    /// Register and run a parsed declaration in one step.
    pub fn run_declaration(
        &self,
        declaration: ActionDeclaration,
    ) -> impl Future<Output = Result<ActionStatus>> + Send + 'static {
        self.add_action(&declaration.action_id, declaration.action.clone());
        self.run_action(&declaration.action_id, declaration.action, false)
    }

    /// Cancel an action. Actions queued behind it still run.
    pub fn abort_action(&self, action_id: &str) -> bool {
        let changed = match self.inner.actions().get_mut(action_id) {
            Some(state) => state.abort(),
            None => return false,
        };

        info!(action_id, "action aborted");
        if changed {
            self.inner.emit_status(action_id, ActionStatus::Aborted);
        }
        true
    }

    /// Abort every action and stop all detached processes.
    pub fn abort_all(&self) {
        let changed: Vec<String> = self
            .inner
            .actions()
            .iter_mut()
            .filter_map(|(id, state)| state.abort().then(|| id.clone()))
            .collect();
        for id in changed {
            self.inner.emit_status(&id, ActionStatus::Aborted);
        }
        self.inner.detached.abort_all();
    }

    /// Resolve once everything queued before this call has run.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Job::Barrier(tx))?;
        rx.await.map_err(|_| anyhow!("action queue stopped"))
    }

    pub fn action(&self, action_id: &str) -> Option<ActionState> {
        self.inner.actions().get(action_id).cloned()
    }

    pub fn actions(&self) -> HashMap<String, ActionState> {
        self.inner.actions().clone()
    }

    pub fn build_output(&self) -> Option<BuildOutput> {
        self.inner.build_output().clone()
    }

    pub fn error_monitor(&self) -> &ErrorMonitor {
        &self.inner.monitor
    }

    pub fn test_runner(&self) -> &TestRunner {
        self.inner.test_runner()
    }

    /// Ids of `start` actions whose process is still running.
    pub fn running_processes(&self) -> Vec<String> {
        self.inner.detached.running()
    }
}

async fn run_queue(inner: Arc<RunnerInner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::MarkRunning(action_id) => inner.mark_running(&action_id),
            Job::Execute {
                action_id,
                streaming,
                done,
            } => {
                let status = inner.execute(&action_id, streaming).await;
                let _ = done.send(status);
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("action queue closed");
}

async fn forward_detached_failures(mut failures: mpsc::UnboundedReceiver<DetachedFailure>, events: EventSink) {
    while let Some(failure) = failures.recv().await {
        error!(action_id = %failure.task_id, "background process failed: {}", failure.error);
        match &failure.error {
            ActionError::Command(_) | ActionError::Precondition(_) => failure.error.alert(&events, AlertSource::Preview),
            other => events.alert(
                AlertKind::Error,
                "Dev Server Failed",
                other.to_string(),
                "",
                AlertSource::Preview,
            ),
        }
    }
}

/// Feed a long-running process's output to the error monitor until it
/// exits. Detected errors are drained from the monitor and emitted per chunk.
async fn watch_process(
    mut process: SandboxProcess,
    monitor: Arc<ErrorMonitor>,
    events: EventSink,
    cancel: CancellationToken,
) -> Result<(), ActionError> {
    let mut output = String::new();
    while let Some(chunk) = process.output.recv().await {
        monitor.monitor_output(&chunk);
        let errors = monitor.take();
        if !errors.is_empty() {
            events.emit(RunnerEvent::CompilationErrors(errors));
        }
        push_tail(&mut output, &chunk, MAX_CAPTURED_OUTPUT);
    }

    let code = process.exit.await.unwrap_or(-1);
    if code != 0 && !cancel.is_cancelled() {
        return Err(ActionCommandError::new("Dev Server Failed", output, code).into());
    }
    debug!(exit_code = code, "long-running process exited");
    Ok(())
}

fn push_tail(buffer: &mut String, chunk: &str, max: usize) {
    buffer.push_str(chunk);
    if buffer.len() > max {
        let mut cut = buffer.len() - max;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

/// Whether any `cd` in a command line enters `dir`.
fn changes_into(command: &str, dir: &str) -> bool {
    let nested = format!("{dir}/");
    command
        .split(|c| c == ';' || c == '&' || c == '|')
        .filter_map(|part| part.trim().strip_prefix("cd "))
        .map(|target| target.trim().trim_start_matches("./").trim_end_matches('/'))
        .any(|target| target == dir || target.starts_with(&nested))
}

fn command_or_default(content: &str, default: &str) -> String {
    match content.trim() {
        "" => default.to_string(),
        command => command.to_string(),
    }
}

impl RunnerInner {
    fn actions(&self) -> MutexGuard<'_, HashMap<String, ActionState>> {
        self.actions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_output(&self) -> MutexGuard<'_, Option<BuildOutput>> {
        self.build_output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self, action_id: &str) -> Option<ActionStatus> {
        self.actions().get(action_id).map(|s| s.status.clone())
    }

    fn emit_status(&self, action_id: &str, status: ActionStatus) {
        debug!(action_id, ?status, "action status changed");
        self.events.emit(RunnerEvent::StatusChanged {
            action_id: action_id.to_string(),
            status,
        });
    }

    /// Move an action to `status` unless it already reached a terminal
    /// state. Returns the status the action ends up with.
    fn update_status(&self, action_id: &str, status: ActionStatus) -> ActionStatus {
        {
            let mut actions = self.actions();
            let Some(state) = actions.get_mut(action_id) else {
                return status;
            };
            if state.status.is_terminal() || state.status == status {
                return state.status.clone();
            }
            state.status = status.clone();
        }
        self.emit_status(action_id, status.clone());
        status
    }

    fn mark_running(&self, action_id: &str) {
        if self.status(action_id) == Some(ActionStatus::Pending) {
            self.update_status(action_id, ActionStatus::Running);
        }
    }

    fn test_runner(&self) -> &TestRunner {
        self.test_runner.get_or_init(|| {
            let testing = &self.config.testing;
            let context = TestContext {
                preview_url: testing.preview_url.clone(),
                probe: self.probe.clone(),
                thresholds: testing.performance,
                api_response_time_ms: testing.api_response_time_ms,
            };
            TestRunner::new(context, self.events.clone())
        })
    }

    async fn execute(&self, action_id: &str, streaming: bool) -> ActionStatus {
        let (action, cancel) = {
            let actions = self.actions();
            let Some(state) = actions.get(action_id) else {
                warn!(action_id, "queued action disappeared");
                return ActionStatus::Failed {
                    error: "Unknown action".to_string(),
                };
            };
            (state.action.clone(), state.cancel_token())
        };

        if cancel.is_cancelled() {
            debug!(action_id, "skipping aborted action");
            return self.status(action_id).unwrap_or(ActionStatus::Aborted);
        }

        self.update_status(action_id, ActionStatus::Running);
        debug!(action_id, kind = action.kind(), streaming, "executing action");

        match self.dispatch(action_id, &action, streaming, &cancel).await {
            Ok(Settled::Complete) => self.update_status(action_id, ActionStatus::Complete),
            Ok(Settled::Streaming) => self.status(action_id).unwrap_or(ActionStatus::Running),
            Ok(Settled::AwaitingConfirmation) => self.update_status(action_id, ActionStatus::Pending),
            Err(e) if cancel.is_cancelled() => {
                debug!(action_id, "ignoring error from aborted action: {}", e);
                self.status(action_id).unwrap_or(ActionStatus::Aborted)
            }
            Err(e) => {
                match &e {
                    ActionError::Command(_) | ActionError::Precondition(_) => {
                        error!(action_id, kind = action.kind(), "action failed: {}", e)
                    }
                    ActionError::Sandbox(_) | ActionError::Unexpected(_) => {
                        error!(action_id, kind = action.kind(), "action failed unexpectedly: {:?}", e)
                    }
                }
                e.alert(&self.events, AlertSource::Terminal);
                self.update_status(
                    action_id,
                    ActionStatus::Failed {
                        error: e.status_message(),
                    },
                )
            }
        }
    }

    async fn dispatch(
        &self,
        action_id: &str,
        action: &Action,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<Settled, ActionError> {
        match action {
            Action::File { file_path, content } => {
                self.write_file(file_path, content).await;
                Ok(if streaming { Settled::Streaming } else { Settled::Complete })
            }
            Action::Shell { content } => {
                self.run_shell(content, cancel).await?;
                Ok(Settled::Complete)
            }
            Action::Start { content } => self.run_start(action_id, content, cancel).await,
            Action::Build { content } => self.run_build(action_id, content, cancel).await,
            Action::Supabase {
                operation,
                file_path,
                content,
                ..
            } => Ok(self.run_supabase(*operation, file_path.as_deref(), content).await?),
            Action::Test { .. } => {
                self.test_runner().run_test_action(action_id, action).await?;
                Ok(Settled::Complete)
            }
            Action::Validate { content } => self.run_validate(content, cancel).await,
            Action::Feedback { content } => {
                info!(action_id, bytes = content.len(), "feedback recorded");
                Ok(Settled::Complete)
            }
        }
    }

    /// Write failures are logged; they never fail the action.
    async fn write_file(&self, file_path: &str, content: &str) {
        let relative = relative_path(self.sandbox.workdir(), file_path);

        if let Some(parent) = parent_dir(&relative) {
            match self.sandbox.mkdir(parent, true).await {
                Ok(()) | Err(SandboxError::AlreadyExists(_)) => {}
                Err(e) => error!("failed to create folder {}: {}", parent, e),
            }
        }

        match self.sandbox.write_file(&relative, content).await {
            Ok(()) => debug!(file = %relative, "file written"),
            Err(e) => error!("failed to write file {}: {}", relative, e),
        }
    }

    async fn check_preconditions(&self, command: &str) -> Result<(), PreconditionError> {
        let dir = &self.config.actions.backend_dir;
        if changes_into(command, dir) && !self.sandbox.exists(dir).await {
            return Err(PreconditionError::MissingDirectory {
                dir: dir.clone(),
                command: command.to_string(),
            });
        }
        Ok(())
    }

    async fn run_command(&self, command_line: &str, cancel: &CancellationToken) -> Result<(String, i32), ActionError> {
        let (program, args) = shell_args(command_line);
        info!(command = command_line, "running command");
        let process = self.sandbox.spawn(&program, &args, cancel.clone()).await?;
        let (output, code) = process.collect().await;
        debug!(command = command_line, exit_code = code, "command exited");
        Ok((output, code))
    }

    async fn run_shell(&self, command: &str, cancel: &CancellationToken) -> Result<(), ActionError> {
        self.check_preconditions(command).await?;
        let (output, code) = self.run_command(command, cancel).await?;
        if code != 0 {
            return Err(ActionCommandError::new("Failed To Execute Shell Command", output, code).into());
        }
        Ok(())
    }

    async fn run_start(&self, action_id: &str, command: &str, cancel: &CancellationToken) -> Result<Settled, ActionError> {
        self.check_preconditions(command).await?;

        let (program, args) = shell_args(command);
        info!(action_id, command, "starting long-running process");
        let process = self.sandbox.spawn(&program, &args, cancel.clone()).await?;

        self.detached.spawn(
            action_id,
            watch_process(process, self.monitor.clone(), self.events.clone(), cancel.clone()),
        );

        // Hold the queue briefly so a following start cannot race for the port.
        tokio::select! {
            _ = tokio::time::sleep(self.config.actions.start_settle_delay()) => {}
            _ = cancel.cancelled() => {}
        }
        Ok(Settled::Complete)
    }

    fn deploy_alert(
        &self,
        kind: AlertKind,
        title: &str,
        description: impl Into<String>,
        content: impl Into<String>,
        build_status: StageStatus,
    ) {
        self.events.emit(RunnerEvent::DeployAlert(DeployAlert {
            kind,
            title: title.to_string(),
            description: description.into(),
            content: content.into(),
            stage: DeployStage::Building,
            build_status: Some(build_status),
            deploy_status: None,
        }));
    }

    /// Feed output to the error monitor; drain and emit anything it holds.
    /// Returns how many errors this output produced.
    fn report_compilation_errors(&self, output: &str) -> usize {
        let found = self.monitor.monitor_output(output).len();
        let errors = self.monitor.take();
        if !errors.is_empty() {
            self.events.emit(RunnerEvent::CompilationErrors(errors));
        }
        found
    }

    async fn run_build(&self, action_id: &str, content: &str, cancel: &CancellationToken) -> Result<Settled, ActionError> {
        let command = command_or_default(content, &self.config.actions.build_command);
        self.deploy_alert(
            AlertKind::Info,
            "Building Application",
            "Building your application...",
            "",
            StageStatus::Running,
        );

        let (output, code) = self.run_command(&command, cancel).await?;
        if cancel.is_cancelled() {
            return Err(ActionCommandError::new("Build Aborted", output, code).into());
        }
        if code != 0 {
            self.report_compilation_errors(&output);
            self.deploy_alert(
                AlertKind::Error,
                "Build Failed",
                "Your application build failed",
                output.as_str(),
                StageStatus::Failed,
            );
            return Err(ActionCommandError::new("Build Failed", output, code).into());
        }

        let path = self.locate_build_output().await;
        info!(action_id, %path, "build finished");
        *self.build_output() = Some(BuildOutput {
            path: path.clone(),
            exit_code: code,
            output,
        });
        self.deploy_alert(
            AlertKind::Success,
            "Build Completed",
            format!("Build output is ready in {path}"),
            "",
            StageStatus::Complete,
        );

        if self.config.actions.auto_test_after_build {
            self.enqueue_followup(
                &format!("{action_id}-browser-test"),
                Action::Test {
                    test_type: TestCategory::Browser,
                    content: String::new(),
                    config: TestConfig::default(),
                },
            );
        }
        Ok(Settled::Complete)
    }

    /// First configured output directory that exists, else the default.
    async fn locate_build_output(&self) -> String {
        let workdir = self.sandbox.workdir().trim_end_matches('/');
        for dir in &self.config.actions.build_output_dirs {
            if self.sandbox.exists(dir).await {
                return format!("{workdir}/{dir}");
            }
        }
        warn!("no build output directory found, assuming the default");
        format!("{workdir}/{}", self.config.actions.default_build_output)
    }

    /// Register an action the runner created itself and queue it behind
    /// whatever is already waiting.
    fn enqueue_followup(&self, action_id: &str, action: Action) {
        let Some(jobs) = self.jobs.upgrade() else {
            warn!(action_id, "action queue stopped, follow-up dropped");
            return;
        };

        {
            let mut actions = self.actions();
            if actions.contains_key(action_id) {
                debug!(action_id, "follow-up already registered");
                return;
            }
            let mut state = ActionState::new(action);
            state.executed = true;
            actions.insert(action_id.to_string(), state);
        }
        self.emit_status(action_id, ActionStatus::Pending);

        let (done, _) = oneshot::channel();
        let job = Job::Execute {
            action_id: action_id.to_string(),
            streaming: false,
            done,
        };
        if jobs.send(job).is_err() {
            warn!(action_id, "action queue stopped, follow-up dropped");
        }
    }

    async fn run_supabase(
        &self,
        operation: SupabaseOperation,
        file_path: Option<&str>,
        content: &str,
    ) -> Result<Settled> {
        match operation {
            SupabaseOperation::Migration => {
                let Some(path) = file_path else {
                    bail!("migration action has no file path");
                };
                self.write_file(path, content).await;
                self.events.emit(RunnerEvent::SupabaseAlert(SupabaseAlert {
                    kind: AlertKind::Info,
                    title: "Supabase Migration".to_string(),
                    description: format!("Create migration file: {path}"),
                    content: content.to_string(),
                    source: "supabase".to_string(),
                }));
                Ok(Settled::Complete)
            }
            SupabaseOperation::Query => {
                self.events.emit(RunnerEvent::SupabaseAlert(SupabaseAlert {
                    kind: AlertKind::Info,
                    title: "Supabase Query".to_string(),
                    description: "Execute database query".to_string(),
                    content: content.to_string(),
                    source: "supabase".to_string(),
                }));
                Ok(Settled::AwaitingConfirmation)
            }
        }
    }

    async fn run_validate(&self, content: &str, cancel: &CancellationToken) -> Result<Settled, ActionError> {
        let command = command_or_default(content, &self.config.actions.validate_command);
        let (output, code) = self.run_command(&command, cancel).await?;

        let found = self.report_compilation_errors(&output);
        if code != 0 && found == 0 {
            return Err(ActionCommandError::new("Validation Failed", output, code).into());
        }
        info!(command, errors = found, "validation finished");
        Ok(Settled::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::CompilationErrorKind;
    use crate::sandbox::{MemorySandbox, ScriptedCommand};
    use crate::testing::StaticProbe;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config() -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.actions.start_settle_delay_ms = 10;
        config.actions.auto_test_after_build = false;
        config
    }

    fn runner(sandbox: &Arc<MemorySandbox>) -> (ActionRunner, UnboundedReceiver<RunnerEvent>) {
        ActionRunner::new(sandbox.clone(), config(), Arc::new(StaticProbe::new()))
    }

    fn shell(command: &str) -> Action {
        Action::Shell {
            content: command.to_string(),
        }
    }

    fn file(path: &str, content: &str) -> Action {
        Action::File {
            file_path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn next_matching<T>(
        rx: &mut UnboundedReceiver<RunnerEvent>,
        pick: impl Fn(RunnerEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn failed(error: &str) -> ActionStatus {
        ActionStatus::Failed {
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_action_twice_is_noop() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        assert!(runner.add_action("a1", shell("echo one")));
        assert!(!runner.add_action("a1", shell("echo two")));

        assert_eq!(runner.actions().len(), 1);
        assert_eq!(runner.action("a1").unwrap().action, shell("echo one"));
    }

    #[tokio::test]
    async fn test_add_action_moves_to_running_after_queue() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        runner.add_action("a1", shell("echo one"));
        assert_eq!(runner.action("a1").unwrap().status, ActionStatus::Pending);

        runner.flush().await.unwrap();
        assert_eq!(runner.action("a1").unwrap().status, ActionStatus::Running);
    }

    #[tokio::test]
    async fn test_streaming_non_file_is_skipped() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, mut rx) = runner(&sandbox);
        runner.add_action("s1", shell("npm install"));
        runner.flush().await.unwrap();
        drain(&mut rx);

        let status = runner.run_action("s1", shell("npm install"), true).await.unwrap();
        runner.flush().await.unwrap();

        assert_eq!(status, ActionStatus::Running);
        assert!(!runner.action("s1").unwrap().executed);
        assert!(sandbox.command_log().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_streaming_file_updates_until_final_run() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);
        runner.add_action("f1", file("/home/project/src/App.tsx", ""));

        let status = runner
            .run_action("f1", file("/home/project/src/App.tsx", "export"), true)
            .await
            .unwrap();
        assert_eq!(status, ActionStatus::Running);
        assert_eq!(sandbox.file("src/App.tsx").as_deref(), Some("export"));
        assert!(!runner.action("f1").unwrap().executed);

        let status = runner
            .run_action("f1", file("/home/project/src/App.tsx", "export default App;"), false)
            .await
            .unwrap();
        assert_eq!(status, ActionStatus::Complete);

        // Executed actions never run again.
        let status = runner
            .run_action("f1", file("/home/project/src/App.tsx", "changed"), false)
            .await
            .unwrap();
        assert_eq!(status, ActionStatus::Complete);
        assert_eq!(sandbox.file("src/App.tsx").as_deref(), Some("export default App;"));
    }

    #[tokio::test]
    async fn test_actions_complete_in_call_order() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("slow").delay(Duration::from_millis(80)));
        sandbox.script(ScriptedCommand::new("fast").delay(Duration::from_millis(5)));
        let (runner, mut rx) = runner(&sandbox);

        runner.add_action("a", shell("echo slow"));
        runner.add_action("b", shell("echo fast"));
        runner.add_action("c", file("notes.txt", "done"));

        let statuses = futures::future::join_all(vec![
            runner.run_action("a", shell("echo slow"), false),
            runner.run_action("b", shell("echo fast"), false),
            runner.run_action("c", file("notes.txt", "done"), false),
        ])
        .await;
        assert!(statuses.into_iter().all(|s| s.unwrap() == ActionStatus::Complete));

        let completed: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunnerEvent::StatusChanged {
                    action_id,
                    status: ActionStatus::Complete,
                } => Some(action_id),
                _ => None,
            })
            .collect();
        assert_eq!(completed, ["a", "b", "c"]);
        assert_eq!(sandbox.command_log(), ["sh -c echo slow", "sh -c echo fast"]);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_block_queue() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("npm test").output("1 failing").exit_code(1));
        let (runner, mut rx) = runner(&sandbox);

        runner.add_action("k", shell("npm test"));
        runner.add_action("k1", file("/src/ok.ts", "ok"));
        let failing = runner.run_action("k", shell("npm test"), false);
        let next = runner.run_action("k1", file("/src/ok.ts", "ok"), false);

        assert_eq!(failing.await.unwrap(), failed("Failed To Execute Shell Command"));
        assert_eq!(next.await.unwrap(), ActionStatus::Complete);

        let alert = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                RunnerEvent::Alert(alert) => Some(alert),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.kind, AlertKind::Error);
        assert!(alert.content.contains("1 failing"));
    }

    #[tokio::test]
    async fn test_abort_wins_over_later_error() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("serve-forever").hang());
        let (runner, mut rx) = runner(&sandbox);

        runner.add_action("h", shell("serve-forever"));
        let pending = tokio::spawn(runner.run_action("h", shell("serve-forever"), false));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(runner.abort_action("h"));
        assert_eq!(pending.await.unwrap().unwrap(), ActionStatus::Aborted);
        assert_eq!(runner.action("h").unwrap().status, ActionStatus::Aborted);
        assert!(!drain(&mut rx).iter().any(|e| matches!(
            e,
            RunnerEvent::StatusChanged {
                status: ActionStatus::Failed { .. },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_aborted_before_running_is_skipped() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        runner.add_action("x", shell("rm -rf node_modules"));
        runner.abort_action("x");
        let status = runner.run_action("x", shell("rm -rf node_modules"), false).await.unwrap();

        assert_eq!(status, ActionStatus::Aborted);
        assert!(sandbox.command_log().is_empty());
        assert!(!runner.abort_action("missing"));
    }

    #[tokio::test]
    async fn test_missing_backend_fails_before_running() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        runner.add_action("b", shell("cd backend && npm install"));
        let status = runner.run_action("b", shell("cd backend && npm install"), false).await.unwrap();

        let ActionStatus::Failed { error } = status else {
            panic!("expected failure, got {status:?}");
        };
        assert!(error.contains("`backend`"));
        assert!(sandbox.command_log().is_empty());

        sandbox.mkdir("backend", true).await.unwrap();
        runner.add_action("b2", shell("cd ./backend/ && npm install"));
        let status = runner.run_action("b2", shell("cd ./backend/ && npm install"), false).await.unwrap();
        assert_eq!(status, ActionStatus::Complete);
    }

    #[tokio::test]
    async fn test_start_reports_compilation_errors_and_keeps_running() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            ScriptedCommand::new("npm run dev")
                .output("  VITE v5.0.0  ready in 300 ms")
                .output("[plugin:vite:react-babel] /home/project/src/App.tsx:12:5 Unexpected token")
                .hang(),
        );
        let (runner, mut rx) = runner(&sandbox);

        runner.add_action("dev", Action::Start {
            content: "npm run dev".to_string(),
        });
        let status = runner
            .run_action("dev", Action::Start { content: "npm run dev".to_string() }, false)
            .await
            .unwrap();
        assert_eq!(status, ActionStatus::Complete);

        let errors = next_matching(&mut rx, |e| match e {
            RunnerEvent::CompilationErrors(errors) => Some(errors),
            _ => None,
        })
        .await;
        assert_eq!(errors[0].kind, CompilationErrorKind::Syntax);
        assert_eq!(errors[0].file, "/src/App.tsx");
        assert!(!runner.error_monitor().has_errors());
        assert_eq!(runner.running_processes(), ["dev"]);

        runner.abort_all();
        assert!(runner.running_processes().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_surfaces_as_preview_alert() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            ScriptedCommand::new("npm run dev")
                .output("Error: listen EADDRINUSE: address already in use :::5173")
                .exit_code(1)
                .delay(Duration::from_millis(20)),
        );
        let (runner, mut rx) = runner(&sandbox);

        let start = Action::Start {
            content: "npm run dev".to_string(),
        };
        runner.add_action("dev", start.clone());
        assert_eq!(runner.run_action("dev", start, false).await.unwrap(), ActionStatus::Complete);

        let alert = next_matching(&mut rx, |e| match e {
            RunnerEvent::Alert(alert) if alert.source == Some(AlertSource::Preview) => Some(alert),
            _ => None,
        })
        .await;
        assert_eq!(alert.title, "Dev Server Failed");
        assert!(alert.content.contains("EADDRINUSE"));
        assert_eq!(runner.action("dev").unwrap().status, ActionStatus::Complete);
    }

    #[tokio::test]
    async fn test_build_records_output_directory() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("npm run build").creates("build/index.html", "<html></html>"));
        let (runner, mut rx) = runner(&sandbox);

        let build = Action::Build { content: String::new() };
        runner.add_action("b", build.clone());
        assert_eq!(runner.run_action("b", build, false).await.unwrap(), ActionStatus::Complete);

        let output = runner.build_output().unwrap();
        assert_eq!(output.path, "/home/project/build");
        assert_eq!(output.exit_code, 0);

        let stages: Vec<Option<StageStatus>> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunnerEvent::DeployAlert(alert) => Some(alert.build_status),
                _ => None,
            })
            .collect();
        assert_eq!(stages, [Some(StageStatus::Running), Some(StageStatus::Complete)]);
    }

    #[tokio::test]
    async fn test_build_without_output_uses_default() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        let build = Action::Build {
            content: "vite build".to_string(),
        };
        runner.add_action("b", build.clone());
        runner.run_action("b", build, false).await.unwrap();

        assert_eq!(runner.build_output().unwrap().path, "/home/project/dist");
        assert_eq!(sandbox.command_log(), ["sh -c vite build"]);
    }

    #[tokio::test]
    async fn test_failed_build() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("npm run build").output("error during build").exit_code(1));
        let (runner, mut rx) = runner(&sandbox);

        let build = Action::Build { content: String::new() };
        runner.add_action("b", build.clone());

        assert_eq!(runner.run_action("b", build, false).await.unwrap(), failed("Build Failed"));
        assert!(runner.build_output().is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            RunnerEvent::DeployAlert(alert) if alert.build_status == Some(StageStatus::Failed)
        )));
    }

    #[tokio::test]
    async fn test_supabase_query_awaits_confirmation() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, mut rx) = runner(&sandbox);

        let query = Action::Supabase {
            operation: SupabaseOperation::Query,
            file_path: None,
            content: "select * from todos".to_string(),
            project_id: None,
        };
        runner.add_action("q", query.clone());

        assert_eq!(runner.run_action("q", query, false).await.unwrap(), ActionStatus::Pending);
        assert!(runner.action("q").unwrap().executed);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, RunnerEvent::SupabaseAlert(alert) if alert.title == "Supabase Query")));
    }

    #[tokio::test]
    async fn test_supabase_migration_writes_file() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        let migration = Action::Supabase {
            operation: SupabaseOperation::Migration,
            file_path: Some("/home/project/supabase/migrations/001_init.sql".to_string()),
            content: "create table todos (id int);".to_string(),
            project_id: Some("proj".to_string()),
        };
        runner.add_action("m", migration.clone());

        assert_eq!(runner.run_action("m", migration, false).await.unwrap(), ActionStatus::Complete);
        assert_eq!(
            sandbox.file("supabase/migrations/001_init.sql").as_deref(),
            Some("create table todos (id int);")
        );
    }

    #[tokio::test]
    async fn test_validate_routes_type_errors_to_feedback() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            ScriptedCommand::new("tsc")
                .output("src/App.tsx(3,7): error TS2322: Type 'string' is not assignable to type 'number'.")
                .exit_code(2),
        );
        let (runner, mut rx) = runner(&sandbox);

        let validate = Action::Validate { content: String::new() };
        runner.add_action("v", validate.clone());

        assert_eq!(runner.run_action("v", validate, false).await.unwrap(), ActionStatus::Complete);
        let errors = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                RunnerEvent::CompilationErrors(errors) => Some(errors),
                _ => None,
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("TS2322"));
        assert!(!runner.error_monitor().has_errors());
    }

    #[tokio::test]
    async fn test_validate_failure_without_recognised_errors() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(ScriptedCommand::new("npm run lint").output("lint crashed").exit_code(1));
        let (runner, _rx) = runner(&sandbox);

        let validate = Action::Validate {
            content: "npm run lint".to_string(),
        };
        runner.add_action("v", validate.clone());

        assert_eq!(runner.run_action("v", validate, false).await.unwrap(), failed("Validation Failed"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error() {
        let sandbox = Arc::new(MemorySandbox::new());
        let (runner, _rx) = runner(&sandbox);

        assert!(runner.run_action("nope", shell("ls"), false).await.is_err());
    }

    #[test]
    fn test_changes_into() {
        assert!(changes_into("cd backend && npm start", "backend"));
        assert!(changes_into("npm i; cd ./backend/src", "backend"));
        assert!(!changes_into("cd frontend && npm start", "backend"));
        assert!(!changes_into("echo cd backend", "backend"));
    }

    #[test]
    fn test_push_tail_keeps_newest_bytes() {
        let mut buffer = String::new();
        push_tail(&mut buffer, "abcdef", 4);
        assert_eq!(buffer, "cdef");
        push_tail(&mut buffer, "é", 4);
        assert_eq!(buffer, "efé");
    }
}
