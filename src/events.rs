//! Everything the runner tells the outside world: UI alerts, compilation
//! errors, test completions and synthesized feedback actions.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::actions::{ActionDeclaration, ActionStatus};
use crate::intelligence::CompilationError;
use crate::testing::TestReport;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Terminal,
    Preview,
    Test,
}

/// Generic alert for terminal and dev-server output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionAlert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<AlertSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupabaseAlert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    pub content: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Building,
    Deploying,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployAlert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    pub content: String,
    pub stage: DeployStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_status: Option<StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_status: Option<StageStatus>,
}

#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Alert(ActionAlert),
    SupabaseAlert(SupabaseAlert),
    DeployAlert(DeployAlert),
    StatusChanged {
        action_id: String,
        status: ActionStatus,
    },
    /// Errors the Error Monitor picked up from process output. The monitor's
    /// buffer is cleared after this is sent.
    CompilationErrors(Vec<CompilationError>),
    TestCompleted {
        action_id: String,
        report: TestReport,
    },
    /// A synthesized action to be re-injected into the conversation.
    Feedback(ActionDeclaration),
}

/// Sending half of the event channel. Sending never fails the caller; a
/// dropped receiver only means nobody is listening.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RunnerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    pub fn alert(
        &self,
        kind: AlertKind,
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        source: AlertSource,
    ) {
        self.emit(RunnerEvent::Alert(ActionAlert {
            kind,
            title: title.into(),
            description: description.into(),
            content: content.into(),
            source: Some(source),
        }));
    }
}
