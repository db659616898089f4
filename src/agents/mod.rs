//! Subagents take a scoped piece of work (a backend route, a UI component),
//! generate the files for it and report back. The [`manager::SubagentManager`]
//! picks the best agent for each task.

pub mod backend;
pub mod frontend;
pub mod manager;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::sandbox::{parent_dir, relative_path, Sandbox, SandboxError};

pub use backend::BackendSubagent;
pub use frontend::FrontendSubagent;
pub use manager::{AgentStats, SubagentManager};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTask {
    #[serde(default = "generate_task_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Milliseconds; the manager fails the task once it runs longer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn generate_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4())
}

impl SubagentTask {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            expected_output: None,
            priority: TaskPriority::default(),
            timeout: None,
            metadata: None,
        }
    }

    /// A string field of `metadata`, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubagentArtifacts {
    pub files: Vec<GeneratedFile>,
    pub commands: Vec<String>,
    pub logs: Vec<String>,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentResult {
    pub task_id: String,
    pub agent_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<SubagentArtifacts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl SubagentResult {
    pub fn success(task_id: &str, agent_name: &str, output: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_name: agent_name.to_string(),
            success: true,
            output: Some(output.into()),
            errors: Vec::new(),
            warnings: Vec::new(),
            artifacts: None,
            suggestions: Vec::new(),
            duration: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(task_id: &str, agent_name: &str, errors: Vec<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_name: agent_name.to_string(),
            success: false,
            output: None,
            errors,
            warnings: Vec::new(),
            artifacts: None,
            suggestions: Vec::new(),
            duration: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The manager's record of a task handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDelegation {
    pub task: SubagentTask,
    pub agent: String,
    pub status: DelegationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubagentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AgentCapabilities {
    pub task_types: Vec<String>,
    pub frameworks: Vec<String>,
}

impl AgentCapabilities {
    pub fn new(task_types: &[&str], frameworks: &[&str]) -> Self {
        Self {
            task_types: task_types.iter().map(|t| t.to_string()).collect(),
            frameworks: frameworks.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[async_trait]
pub trait Subagent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &AgentCapabilities;

    fn can_handle(&self, task: &SubagentTask) -> bool {
        self.capabilities().task_types.iter().any(|t| *t == task.task_type)
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Errors returned here become a failed result; they never reach the
    /// manager's caller.
    async fn execute(&self, task: &SubagentTask) -> Result<SubagentResult>;
}

/// Words that never name the thing a task is about.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "for", "of", "to", "and", "with", "create", "build", "add", "make", "implement", "new",
    "api", "endpoint", "endpoints", "component", "page", "route", "routes", "crud", "simple", "basic",
];

/// What a task is about: `metadata.name`, else the first meaningful words
/// of the description.
pub(crate) fn task_subject(task: &SubagentTask) -> Vec<String> {
    if let Some(name) = task.metadata_str("name") {
        return words(name);
    }
    let subject: Vec<String> = words(&task.description)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .take(2)
        .collect();
    if subject.is_empty() {
        vec!["item".to_string()]
    } else {
        subject
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub(crate) fn kebab_case(words: &[String]) -> String {
    words.join("-")
}

pub(crate) fn pascal_case(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Task text made safe to embed in a `//` or `/* */` comment: one line,
/// no comment terminator.
pub(crate) fn comment_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").replace("*/", "* /")
}

/// Write generated files into the sandbox, creating parent directories.
pub(crate) async fn write_generated(sandbox: &Arc<dyn Sandbox>, files: &[GeneratedFile]) -> Result<(), SandboxError> {
    for file in files {
        let relative = relative_path(sandbox.workdir(), &file.path);
        if let Some(parent) = parent_dir(&relative) {
            match sandbox.mkdir(parent, true).await {
                Ok(()) | Err(SandboxError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        sandbox.write_file(&relative, &file.content).await?;
    }
    Ok(())
}
