use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{
    comment_text, kebab_case, pascal_case, task_subject, write_generated, AgentCapabilities, GeneratedFile, Subagent,
    SubagentArtifacts, SubagentResult, SubagentTask,
};
use crate::sandbox::Sandbox;

/// Generates an Express router plus an in-memory model for one resource.
pub struct BackendSubagent {
    sandbox: Arc<dyn Sandbox>,
    capabilities: AgentCapabilities,
}

impl BackendSubagent {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            capabilities: AgentCapabilities::new(&["backend", "api", "database"], &["express", "node"]),
        }
    }
}

fn requirement_comments(task: &SubagentTask) -> String {
    task.requirements
        .iter()
        .chain(task.constraints.iter())
        .map(|r| format!("// - {}\n", comment_text(r)))
        .collect()
}

fn model_file(resource: &str, model: &str) -> GeneratedFile {
    let content = format!(
        r#"const {resource_var} = new Map();
let nextId = 1;

class {model} {{
  static all() {{
    return Array.from({resource_var}.values());
  }}

  static find(id) {{
    return {resource_var}.get(Number(id)) || null;
  }}

  static create(data) {{
    const record = {{ id: nextId++, ...data, createdAt: new Date().toISOString() }};
    {resource_var}.set(record.id, record);
    return record;
  }}

  static update(id, data) {{
    const existing = {model}.find(id);
    if (!existing) return null;
    const updated = {{ ...existing, ...data, id: existing.id }};
    {resource_var}.set(existing.id, updated);
    return updated;
  }}

  static remove(id) {{
    return {resource_var}.delete(Number(id));
  }}
}}

module.exports = {model};
"#,
        resource_var = format!("{}Store", model.to_lowercase()),
        model = model,
    );
    GeneratedFile {
        path: format!("backend/models/{resource}.js"),
        content,
    }
}

fn router_file(task: &SubagentTask, resource: &str, model: &str) -> GeneratedFile {
    let content = format!(
        r#"// {description}
{requirements}const express = require('express');
const {model} = require('../models/{resource}');

const router = express.Router();

router.get('/', (req, res) => {{
  res.json({model}.all());
}});

router.get('/:id', (req, res) => {{
  const record = {model}.find(req.params.id);
  if (!record) return res.status(404).json({{ error: '{model} not found' }});
  res.json(record);
}});

router.post('/', (req, res) => {{
  if (!req.body || Object.keys(req.body).length === 0) {{
    return res.status(400).json({{ error: 'Request body is required' }});
  }}
  res.status(201).json({model}.create(req.body));
}});

router.put('/:id', (req, res) => {{
  const updated = {model}.update(req.params.id, req.body || {{}});
  if (!updated) return res.status(404).json({{ error: '{model} not found' }});
  res.json(updated);
}});

router.delete('/:id', (req, res) => {{
  if (!{model}.remove(req.params.id)) {{
    return res.status(404).json({{ error: '{model} not found' }});
  }}
  res.status(204).end();
}});

module.exports = router;
"#,
        description = comment_text(&task.description),
        requirements = requirement_comments(task),
        model = model,
        resource = resource,
    );
    GeneratedFile {
        path: format!("backend/routes/{resource}.js"),
        content,
    }
}

#[async_trait]
impl Subagent for BackendSubagent {
    fn name(&self) -> &str {
        "BackendSubagent"
    }

    fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    async fn execute(&self, task: &SubagentTask) -> Result<SubagentResult> {
        let subject = task_subject(task);
        let resource = kebab_case(&subject);
        let model = pascal_case(&subject);
        info!(task_id = %task.id, %resource, "generating backend resource");

        let files = vec![model_file(&resource, &model), router_file(task, &resource, &model)];
        if let Err(e) = write_generated(&self.sandbox, &files).await {
            return Ok(SubagentResult::failure(
                &task.id,
                self.name(),
                vec![format!("Failed to write backend files: {e}")],
            ));
        }

        let mut result = SubagentResult::success(
            &task.id,
            self.name(),
            format!("Generated CRUD routes for {resource} under /api/{resource}"),
        );
        result.suggestions.push(format!(
            "Mount the router in backend/server.js: app.use('/api/{resource}', require('./routes/{resource}'))"
        ));
        if !task.constraints.is_empty() {
            result
                .warnings
                .push("Constraints are recorded as comments in the router; check them by hand".to_string());
        }
        result.artifacts = Some(SubagentArtifacts {
            metrics: [("files".to_string(), files.len() as f64)].into_iter().collect(),
            files,
            commands: vec!["cd backend && npm install express".to_string()],
            logs: vec![format!("resource: {resource}")],
        });
        Ok(result)
    }
}
