//! The execution environment actions run against: one filesystem and one
//! process surface, shared by everything in a run.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use local::LocalSandbox;
pub use memory::{MemorySandbox, ScriptedCommand};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("path escapes the sandbox root: {0}")]
    PathEscape(String),

    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
}

/// A running process. Output arrives as chunks (lines for real processes);
/// `exit` resolves with the exit code once the process ends. A process killed
/// through its cancellation token exits with a non-zero code.
#[derive(Debug)]
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

impl SandboxProcess {
    /// Drain all output, then wait for the exit code.
    pub async fn collect(mut self) -> (String, i32) {
        let mut buffer = String::new();
        while let Some(chunk) = self.output.recv().await {
            buffer.push_str(&chunk);
        }
        // A dropped exit sender means the process driver went away.
        let code = self.exit.await.unwrap_or(-1);
        (buffer, code)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Absolute project root as seen by actions, e.g. `/home/project`.
    fn workdir(&self) -> &str;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError>;

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<SandboxProcess, SandboxError>;

    async fn exists(&self, path: &str) -> bool {
        self.read_dir(path).await.is_ok()
    }
}

/// Turn an action path into a path relative to the sandbox root. Accepts
/// paths under `workdir`, rooted paths (`/src/x`) and plain relative ones.
pub fn relative_path(workdir: &str, path: &str) -> String {
    let trimmed_root = workdir.trim_end_matches('/');
    let stripped = match path.strip_prefix(trimmed_root) {
        Some(rest) if !trimmed_root.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
        _ => path,
    };
    stripped.trim_start_matches("./").trim_start_matches('/').to_string()
}

/// Parent directory of a relative path, `None` at the root.
pub fn parent_dir(relative: &str) -> Option<&str> {
    relative.rfind('/').map(|idx| &relative[..idx]).filter(|p| !p.is_empty())
}

/// Shell invocation used for `shell`, `start`, `build` and `validate`.
pub fn shell_args(command_line: &str) -> (String, Vec<String>) {
    ("sh".to_string(), vec!["-c".to_string(), command_line.to_string()])
}
