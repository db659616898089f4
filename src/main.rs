use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use artifact_runner::actions::{ActionDeclaration, ActionRunner};
use artifact_runner::agents::{SubagentManager, SubagentTask};
use artifact_runner::config::RunnerConfig;
use artifact_runner::events::RunnerEvent;
use artifact_runner::logging;
use artifact_runner::sandbox::{LocalSandbox, Sandbox};
use artifact_runner::testing::ReqwestProbe;

#[derive(Parser)]
#[command(name = "artifact-runner", version, about = "Run LLM-declared actions against a project directory")]
struct Cli {
    /// Config file (defaults to ~/.config/artifact-runner/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project directory; overrides `sandbox.workdir` from the config.
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a JSON array of action declarations in order.
    Run { actions: PathBuf },
    /// Dispatch a JSON array of subagent tasks and print the results.
    Delegate { tasks: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let cli = Cli::parse();
    let mut config = RunnerConfig::load_or_default(cli.config.as_deref())?;
    if let Some(workdir) = cli.workdir {
        config.sandbox.workdir = workdir;
    }

    match cli.command {
        Command::Run { actions } => run_actions(config, &actions).await,
        Command::Delegate { tasks } => delegate(config, &tasks).await,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn sandbox_for(config: &RunnerConfig) -> Result<Arc<dyn Sandbox>> {
    let sandbox = LocalSandbox::new(config.sandbox.workdir.clone())
        .with_context(|| format!("opening project directory {}", config.sandbox.workdir.display()))?;
    Ok(Arc::new(sandbox))
}

async fn run_actions(config: RunnerConfig, path: &Path) -> Result<()> {
    let declarations: Vec<ActionDeclaration> = read_json(path)?;
    let sandbox = sandbox_for(&config)?;
    let probe = Arc::new(ReqwestProbe::new(config.testing.request_timeout())?);

    let (runner, mut events) = ActionRunner::new(sandbox, config, probe);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = describe(&event) {
                println!("{line}");
            }
        }
    });

    let ids: Vec<String> = declarations.iter().map(|d| d.action_id.clone()).collect();
    let pending: Vec<_> = declarations.into_iter().map(|d| runner.run_declaration(d)).collect();
    for (id, outcome) in ids.iter().zip(futures::future::join_all(pending).await) {
        if let Err(e) = outcome {
            eprintln!("{id}: {e:#}");
        }
    }
    runner.flush().await?;

    let statuses: BTreeMap<String, _> = runner
        .actions()
        .into_iter()
        .map(|(id, state)| (id, state.status))
        .collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    // Dev servers die with the runner.
    runner.abort_all();
    drop(runner);
    if tokio::time::timeout(Duration::from_millis(500), printer).await.is_err() {
        tracing::debug!("event printer still running at exit");
    }
    Ok(())
}

async fn delegate(config: RunnerConfig, path: &Path) -> Result<()> {
    let tasks: Vec<SubagentTask> = read_json(path)?;
    let sandbox = sandbox_for(&config)?;
    let manager = SubagentManager::with_defaults(sandbox, &config.subagents);

    let results = manager.delegate_tasks(tasks).await;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn describe(event: &RunnerEvent) -> Option<String> {
    let line = match event {
        RunnerEvent::Alert(alert) => format!("[{:?}] {}: {}", alert.kind, alert.title, alert.description),
        RunnerEvent::SupabaseAlert(alert) => format!("[supabase] {}: {}", alert.title, alert.description),
        RunnerEvent::DeployAlert(alert) => format!("[deploy {:?}] {}", alert.stage, alert.title),
        RunnerEvent::CompilationErrors(errors) => errors
            .iter()
            .map(|e| format!("[compile] {} {}", e.location(), e.message))
            .collect::<Vec<_>>()
            .join("\n"),
        RunnerEvent::TestCompleted { action_id, report } => format!(
            "[test] {action_id}: {}/{} passed",
            report.summary.passed, report.summary.total
        ),
        RunnerEvent::StatusChanged { .. } | RunnerEvent::Feedback(_) => return None,
    };
    Some(line)
}
