use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{
    comment_text, kebab_case, pascal_case, task_subject, write_generated, AgentCapabilities, GeneratedFile, Subagent,
    SubagentArtifacts, SubagentResult, SubagentTask,
};
use crate::sandbox::Sandbox;

/// Generates a typed React component with a CSS module next to it.
pub struct FrontendSubagent {
    sandbox: Arc<dyn Sandbox>,
    capabilities: AgentCapabilities,
}

impl FrontendSubagent {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            capabilities: AgentCapabilities::new(&["frontend", "component", "ui"], &["react", "typescript"]),
        }
    }
}

fn component_file(task: &SubagentTask, component: &str, class: &str) -> GeneratedFile {
    let notes: String = task
        .requirements
        .iter()
        .map(|r| format!(" * - {}\n", comment_text(r)))
        .collect();
    let content = format!(
        r#"import styles from './{component}.module.css';

/**
 * {description}
{notes} */
export interface {component}Props {{
  title?: string;
  children?: React.ReactNode;
}}

export default function {component}({{ title, children }}: {component}Props) {{
  return (
    <section className={{styles.{class}}} aria-label={{title ?? '{component}'}}>
      {{title && <h2 className={{styles.title}}>{{title}}</h2>}}
      {{children}}
    </section>
  );
}}
"#,
        description = comment_text(&task.description),
    );
    GeneratedFile {
        path: format!("src/components/{component}.tsx"),
        content,
    }
}

fn stylesheet_file(component: &str, class: &str) -> GeneratedFile {
    let content = format!(
        r#".{class} {{
  display: flex;
  flex-direction: column;
  gap: 0.75rem;
  padding: 1rem;
}}

.title {{
  margin: 0;
  font-size: 1.25rem;
}}
"#
    );
    GeneratedFile {
        path: format!("src/components/{component}.module.css"),
        content,
    }
}

#[async_trait]
impl Subagent for FrontendSubagent {
    fn name(&self) -> &str {
        "FrontendSubagent"
    }

    fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    async fn execute(&self, task: &SubagentTask) -> Result<SubagentResult> {
        let subject = task_subject(task);
        let component = pascal_case(&subject);
        // CSS module class names are accessed as properties, so no dashes.
        let class = kebab_case(&subject).replace('-', "_");
        info!(task_id = %task.id, %component, "generating component");

        let files = vec![
            component_file(task, &component, &class),
            stylesheet_file(&component, &class),
        ];
        if let Err(e) = write_generated(&self.sandbox, &files).await {
            return Ok(SubagentResult::failure(
                &task.id,
                self.name(),
                vec![format!("Failed to write component files: {e}")],
            ));
        }

        let mut result = SubagentResult::success(
            &task.id,
            self.name(),
            format!("Generated component {component} in src/components/{component}.tsx"),
        );
        result
            .suggestions
            .push(format!("Import it with: import {component} from './components/{component}'"));
        if !task.constraints.is_empty() {
            result
                .warnings
                .push("Constraints were not applied automatically; review the component".to_string());
        }
        result.artifacts = Some(SubagentArtifacts {
            metrics: [("files".to_string(), files.len() as f64)].into_iter().collect(),
            files,
            commands: Vec::new(),
            logs: vec![format!("component: {component}")],
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MemorySandbox;

    #[tokio::test]
    async fn test_generates_component_and_styles() {
        let sandbox = Arc::new(MemorySandbox::new());
        let agent = FrontendSubagent::new(sandbox.clone());
        let mut task = SubagentTask::new("t1", "component", "Create a user profile card");
        task.constraints.push("No external UI libraries".to_string());

        let result = agent.execute(&task).await.unwrap();

        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        let component = sandbox.file("src/components/UserProfile.tsx").unwrap();
        assert!(component.contains("export interface UserProfileProps"));
        assert!(component.contains("styles.user_profile"));
        assert!(sandbox
            .file("/home/project/src/components/UserProfile.module.css")
            .unwrap()
            .starts_with(".user_profile {"));
    }

    #[tokio::test]
    async fn test_comment_terminator_in_task_text_is_neutralised() {
        let sandbox = Arc::new(MemorySandbox::new());
        let agent = FrontendSubagent::new(sandbox.clone());
        let mut task = SubagentTask::new("t1", "ui", "Order badge */ export const x = 1;");
        task.requirements.push("Round corners\n*/".to_string());

        agent.execute(&task).await.unwrap();

        let component = sandbox.file("src/components/OrderBadge.tsx").unwrap();
        assert_eq!(component.matches("*/").count(), 1);
        assert!(component.contains(" * Order badge * / export const x = 1;\n"));
        assert!(component.contains(" * - Round corners * /\n"));
    }
}
