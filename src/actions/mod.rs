//! Actions emitted by the model and the runner that executes them.

pub mod background;
pub mod errors;
pub mod runner;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::testing::{TestCategory, TestConfig};

pub use background::{DetachedFailure, DetachedTasks};
pub use errors::{ActionCommandError, ActionError, PreconditionError};
pub use runner::{ActionRunner, BuildOutput};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SupabaseOperation {
    Migration,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    File {
        #[serde(rename = "filePath")]
        file_path: String,
        #[serde(default)]
        content: String,
    },
    Shell {
        content: String,
    },
    /// Long-running process such as a dev server.
    Start {
        content: String,
    },
    /// Empty content runs the configured build command.
    Build {
        #[serde(default)]
        content: String,
    },
    Supabase {
        operation: SupabaseOperation,
        #[serde(rename = "filePath", default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    Test {
        #[serde(rename = "testType")]
        test_type: TestCategory,
        #[serde(default)]
        content: String,
        #[serde(default)]
        config: TestConfig,
    },
    Validate {
        #[serde(default)]
        content: String,
    },
    Feedback {
        #[serde(default)]
        content: String,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::File { .. } => "file",
            Action::Shell { .. } => "shell",
            Action::Start { .. } => "start",
            Action::Build { .. } => "build",
            Action::Supabase { .. } => "supabase",
            Action::Test { .. } => "test",
            Action::Validate { .. } => "validate",
            Action::Feedback { .. } => "feedback",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Action::File { content, .. }
            | Action::Shell { content }
            | Action::Start { content }
            | Action::Build { content }
            | Action::Supabase { content, .. }
            | Action::Test { content, .. }
            | Action::Validate { content }
            | Action::Feedback { content } => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Complete,
    Aborted,
    Failed { error: String },
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Complete | ActionStatus::Aborted | ActionStatus::Failed { .. })
    }
}

/// The runner's record of one action.
#[derive(Debug, Clone)]
pub struct ActionState {
    pub action: Action,
    pub status: ActionStatus,
    /// Set once a non-streaming run was accepted; the action never runs again.
    pub executed: bool,
    cancel: CancellationToken,
}

impl ActionState {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            status: ActionStatus::Pending,
            executed: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel whatever the action is running. Returns true if the status
    /// changed; terminal states stay as they are.
    pub fn abort(&mut self) -> bool {
        self.cancel.cancel();
        if self.status.is_terminal() {
            return false;
        }
        self.status = ActionStatus::Aborted;
        true
    }
}

/// An action as it arrives from the message parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDeclaration {
    pub action_id: String,
    pub message_id: String,
    pub action: Action,
}
