use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_request_timeout(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_model_id() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }
fn default_request_timeout() -> u64 { 120 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_llm_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_llm_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// How the engine behaves when a step needs a human.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Block on the approval channel (optionally with a timeout).
    #[default]
    Wait,
    /// Return immediately with a resumable suspended run.
    Suspend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retry budget for steps that do not set their own.
    #[serde(default = "default_max_retries_per_step")]
    pub max_retries_per_step: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Hard ceiling on worker dispatches in one run.
    #[serde(default = "default_max_total_dispatches")]
    pub max_total_dispatches: usize,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Iteration ceiling for the model tool loop in `llm_query` steps.
    #[serde(default = "default_llm_max_iterations")]
    pub llm_max_iterations: usize,
    #[serde(default = "default_max_subplan_depth")]
    pub max_subplan_depth: usize,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// None waits indefinitely.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_step: default_max_retries_per_step(),
            max_replans: default_max_replans(),
            max_total_dispatches: default_max_total_dispatches(),
            max_parallel_steps: default_max_parallel_steps(),
            llm_max_iterations: default_llm_max_iterations(),
            max_subplan_depth: default_max_subplan_depth(),
            approval_mode: ApprovalMode::default(),
            approval_timeout_secs: None,
        }
    }
}

fn default_max_retries_per_step() -> u32 { 3 }
fn default_max_replans() -> u32 { 3 }
fn default_max_total_dispatches() -> usize { 100 }
fn default_max_parallel_steps() -> usize { 1 }
fn default_llm_max_iterations() -> usize { 10 }
fn default_max_subplan_depth() -> usize { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Minimum confidence for an `uncertain` response to be selected.
    #[serde(default = "default_uncertain_threshold")]
    pub uncertain_threshold: f64,
    #[serde(default = "default_capability_timeout")]
    pub capability_timeout_secs: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_max_handoff_depth")]
    pub max_handoff_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            uncertain_threshold: default_uncertain_threshold(),
            capability_timeout_secs: default_capability_timeout(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            max_handoff_depth: default_max_handoff_depth(),
        }
    }
}

fn default_uncertain_threshold() -> f64 { 0.7 }
fn default_capability_timeout() -> u64 { 30 }
fn default_dispatch_timeout() -> u64 { 600 }
fn default_max_handoff_depth() -> usize { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./hive-logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-step, 3 = per-decision (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => expand_home(dir),
            None => PathBuf::from("hive-logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HiveError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| HiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.orchestrator.uncertain_threshold) {
            return Err(HiveError::Config(format!(
                "orchestrator.uncertain_threshold must be within [0, 1], got {}",
                self.orchestrator.uncertain_threshold
            )));
        }
        if self.executor.max_parallel_steps == 0 {
            return Err(HiveError::Config(
                "executor.max_parallel_steps must be at least 1".to_string(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(HiveError::Config(format!(
                    "log.level must be 1, 2 or 3, got {}",
                    log.level
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
