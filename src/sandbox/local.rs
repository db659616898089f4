use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{relative_path, Sandbox, SandboxError, SandboxProcess};

/// Exit code reported for a process killed through its cancellation token.
const CANCELLED_EXIT_CODE: i32 = 130;

/// Sandbox over a real directory. Every path is confined to `root`.
pub struct LocalSandbox {
    root: PathBuf,
    workdir: String,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let workdir = root.to_string_lossy().to_string();
        Ok(Self { root, workdir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = relative_path(&self.workdir, path);
        let candidate = Path::new(&relative);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(SandboxError::PathEscape(path.to_string()));
        }
        Ok(self.root.join(candidate))
    }
}

fn map_io(path: &str, err: std::io::Error) -> SandboxError {
    match err.kind() {
        std::io::ErrorKind::NotFound => SandboxError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => SandboxError::AlreadyExists(path.to_string()),
        _ => SandboxError::Io(err),
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(format!("{line}\n")).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("stopped reading process output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, content).await.map_err(|e| map_io(path, e))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&target).await
        } else {
            tokio::fs::create_dir(&target).await
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let target = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&target).await.map_err(|e| map_io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<SandboxProcess, SandboxError> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        debug!(command, ?args, pid = ?child.id(), "spawned process");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let stdout_task = child.stdout.take().map(|s| tokio::spawn(forward_lines(s, out_tx.clone())));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(forward_lines(s, out_tx.clone())));
        drop(out_tx);

        let command = command.to_string();
        tokio::spawn(async move {
            let (code, cancelled) = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => (status.code().unwrap_or(-1), false),
                    Err(e) => {
                        warn!("failed to wait for `{}`: {}", command, e);
                        (-1, false)
                    }
                },
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill `{}`: {}", command, e);
                    }
                    (CANCELLED_EXIT_CODE, true)
                }
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if cancelled {
                    // Grandchildren may still hold the pipes open.
                    task.abort();
                } else {
                    let _ = task.await;
                }
            }

            debug!(command, code, cancelled, "process exited");
            let _ = exit_tx.send(code);
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::shell_args;

    #[tokio::test]
    async fn test_write_and_list_files() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();

        sandbox.mkdir("src/components", true).await.unwrap();
        sandbox.write_file("/src/components/App.tsx", "export {}").await.unwrap();

        let names = sandbox.read_dir("src/components").await.unwrap();
        assert_eq!(names, vec!["App.tsx".to_string()]);
        assert!(sandbox.exists("src").await);
        assert!(!sandbox.exists("missing").await);
    }

    #[tokio::test]
    async fn test_rejects_parent_escape() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();

        let err = sandbox.write_file("../outside.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_non_recursive_mkdir_reports_existing() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();

        sandbox.mkdir("dist", false).await.unwrap();
        let err = sandbox.mkdir("dist", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();

        let (cmd, args) = shell_args("echo hello && echo oops 1>&2 && exit 3");
        let process = sandbox.spawn(&cmd, &args, CancellationToken::new()).await.unwrap();
        let (output, code) = process.collect().await;

        assert_eq!(code, 3);
        assert!(output.contains("hello"));
        assert!(output.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();
        let cancel = CancellationToken::new();

        let (cmd, args) = shell_args("sleep 30");
        let process = sandbox.spawn(&cmd, &args, cancel.clone()).await.unwrap();
        cancel.cancel();

        let (_, code) = tokio::time::timeout(std::time::Duration::from_secs(5), process.collect())
            .await
            .unwrap();
        assert_eq!(code, CANCELLED_EXIT_CODE);
    }
}
