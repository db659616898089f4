use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{parent_dir, relative_path, Sandbox, SandboxError, SandboxProcess};

/// How a scripted command behaves when a spawned command line contains
/// `matcher`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommand {
    pub matcher: String,
    pub output: Vec<String>,
    pub exit_code: i32,
    /// Files (relative path, content) that appear once the command runs.
    pub creates: Vec<(String, String)>,
    pub delay: Duration,
    /// Keep running until cancelled, like a dev server.
    pub hang: bool,
}

impl ScriptedCommand {
    pub fn new(matcher: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            ..Self::default()
        }
    }

    pub fn output(mut self, line: impl Into<String>) -> Self {
        self.output.push(line.into());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn creates(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.creates.push((path.into(), content.into()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    scripts: Vec<ScriptedCommand>,
    command_log: Vec<String>,
}

/// In-memory sandbox with scripted processes. Unscripted commands exit 0
/// with no output.
pub struct MemorySandbox {
    workdir: String,
    state: Mutex<MemoryState>,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self {
            workdir: "/home/project".to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn script(&self, command: ScriptedCommand) {
        self.state().scripts.push(command);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        let relative = relative_path(&self.workdir, path);
        self.state().files.get(&relative).cloned()
    }

    pub fn files(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    /// Every spawned command line, in spawn order.
    pub fn command_log(&self) -> Vec<String> {
        self.state().command_log.clone()
    }

    fn insert_dirs(state: &mut MemoryState, relative: &str) {
        let mut current = String::new();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            state.dirs.insert(current.clone());
        }
    }

    fn dir_exists(state: &MemoryState, relative: &str) -> bool {
        relative.is_empty() || state.dirs.contains(relative)
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let relative = relative_path(&self.workdir, path);
        let mut state = self.state();
        if let Some(parent) = parent_dir(&relative) {
            if !Self::dir_exists(&state, parent) {
                return Err(SandboxError::NotFound(parent.to_string()));
            }
        }
        state.files.insert(relative, content.to_string());
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let relative = relative_path(&self.workdir, path);
        let mut state = self.state();
        if !recursive {
            if Self::dir_exists(&state, &relative) {
                return Err(SandboxError::AlreadyExists(relative));
            }
            if let Some(parent) = parent_dir(&relative) {
                if !Self::dir_exists(&state, parent) {
                    return Err(SandboxError::NotFound(parent.to_string()));
                }
            }
        }
        Self::insert_dirs(&mut state, &relative);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let relative = relative_path(&self.workdir, path);
        let state = self.state();
        if !Self::dir_exists(&state, &relative) {
            return Err(SandboxError::NotFound(relative));
        }

        let prefix = if relative.is_empty() {
            String::new()
        } else {
            format!("{relative}/")
        };
        let children: BTreeSet<String> = state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter_map(|entry| entry.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<SandboxProcess, SandboxError> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let script = {
            let mut state = self.state();
            state.command_log.push(line.clone());
            state
                .scripts
                .iter()
                .find(|s| line.contains(&s.matcher))
                .cloned()
                .unwrap_or_default()
        };

        if !script.creates.is_empty() {
            let mut state = self.state();
            for (path, content) in &script.creates {
                let relative = relative_path(&self.workdir, path);
                if let Some(parent) = parent_dir(&relative) {
                    Self::insert_dirs(&mut state, parent);
                }
                state.files.insert(relative, content.clone());
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            for chunk in &script.output {
                let _ = out_tx.send(format!("{chunk}\n"));
            }

            let code = tokio::select! {
                _ = cancel.cancelled() => 130,
                _ = async {
                    tokio::time::sleep(script.delay).await;
                    if script.hang {
                        std::future::pending::<()>().await;
                    }
                } => script.exit_code,
            };

            drop(out_tx);
            let _ = exit_tx.send(code);
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
        })
    }
}
