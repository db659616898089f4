use crate::events::{AlertKind, AlertSource, EventSink};
use crate::sandbox::SandboxError;

/// A process the runner started exited non-zero.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{header}")]
pub struct ActionCommandError {
    pub header: String,
    pub output: String,
    pub exit_code: i32,
}

impl ActionCommandError {
    pub fn new(header: impl Into<String>, output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            header: header.into(),
            output: output.into(),
            exit_code,
        }
    }
}

/// Something a command needs is missing; raised before the command runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreconditionError {
    #[error("Directory `{dir}` does not exist. Create it (and its project files) before running `{command}`")]
    MissingDirectory { dir: String, command: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Command(#[from] ActionCommandError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ActionError {
    /// What the action's `failed` status carries. Detail of unexpected errors
    /// goes to the log only.
    pub fn status_message(&self) -> String {
        match self {
            ActionError::Command(e) => e.header.clone(),
            ActionError::Precondition(e) => e.to_string(),
            ActionError::Sandbox(_) | ActionError::Unexpected(_) => "Action failed".to_string(),
        }
    }

    /// Emit a user alert for the errors that carry enough structure for one.
    pub fn alert(&self, events: &EventSink, source: AlertSource) {
        match self {
            ActionError::Command(e) => events.alert(
                AlertKind::Error,
                &e.header,
                format!("Process exited with code {}", e.exit_code),
                &e.output,
                source,
            ),
            ActionError::Precondition(e) => {
                events.alert(AlertKind::Error, "Missing Precondition", e.to_string(), "", source)
            }
            ActionError::Sandbox(_) | ActionError::Unexpected(_) => {}
        }
    }
}
