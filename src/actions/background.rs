use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ActionError;

/// A detached task that ended with an error.
#[derive(Debug)]
pub struct DetachedFailure {
    pub task_id: String,
    pub error: ActionError,
}

/// Tasks that run outside the action queue, such as dev servers. Their
/// errors arrive on the failure channel handed out by [`DetachedTasks::new`].
pub struct DetachedTasks {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    failures: mpsc::UnboundedSender<DetachedFailure>,
}

impl DetachedTasks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DetachedFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let tasks = Self {
            tasks: Mutex::new(HashMap::new()),
            failures,
        };
        (tasks, rx)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` under `id`. A previous task with the same id is aborted.
    pub fn spawn<F>(&self, id: &str, task: F)
    where
        F: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let failures = self.failures.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!(task_id, "detached task finished"),
                Err(error) => {
                    warn!(task_id, "detached task failed: {}", error);
                    let _ = failures.send(DetachedFailure { task_id, error });
                }
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Ids of tasks still running.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn abort_all(&self) {
        for (id, handle) in self.tasks().drain() {
            debug!(task_id = %id, "aborting detached task");
            handle.abort();
        }
    }
}

impl Drop for DetachedTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
