use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runner configuration, read from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub sandbox: SandboxConfig,
    pub actions: ActionConfig,
    pub testing: TestingConfig,
    pub subagents: SubagentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Project root every action runs against.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionConfig {
    /// How long a `start` action holds the queue before the next action runs.
    pub start_settle_delay_ms: u64,
    /// Directory that `cd <dir>` shell commands must find before running.
    pub backend_dir: String,
    pub build_command: String,
    pub validate_command: String,
    /// Checked in order after a successful build; first existing one wins.
    pub build_output_dirs: Vec<String>,
    pub default_build_output: String,
    pub auto_test_after_build: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestingConfig {
    pub preview_url: String,
    pub request_timeout_ms: u64,
    pub api_response_time_ms: u64,
    pub performance: PerformanceThresholds,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceThresholds {
    pub max_load_time_ms: u64,
    pub max_html_bytes: usize,
    pub max_resources: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent_tasks: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            start_settle_delay_ms: 2000,
            backend_dir: "backend".to_string(),
            build_command: "npm run build".to_string(),
            validate_command: "npx tsc --noEmit".to_string(),
            build_output_dirs: ["dist", "build", "out", "output", ".next", "public"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            default_build_output: "dist".to_string(),
            auto_test_after_build: true,
        }
    }
}

impl ActionConfig {
    pub fn start_settle_delay(&self) -> Duration {
        Duration::from_millis(self.start_settle_delay_ms)
    }
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            preview_url: "http://localhost:5173".to_string(),
            request_timeout_ms: 10_000,
            api_response_time_ms: 1000,
            performance: PerformanceThresholds::default(),
        }
    }
}

impl TestingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_load_time_ms: 3000,
            max_html_bytes: 100 * 1024,
            max_resources: 50,
        }
    }
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path`, or from the default location when `None`. A missing
    /// default file is not an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("artifact-runner").join("config.toml"))
    }
}
