use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hive_core::config::ExecutorConfig;
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::goal::Goal;
use hive_core::traits::{LlmProvider, ToolExecutor};
use hive_core::types::ToolDefinition;
use hive_tools::ToolRegistry;

use crate::approval::ApprovalGate;
use crate::executor::FlexibleExecutor;
use crate::judge::{create_default_judge, EvaluationRule};
use crate::plan::{Plan, PlanStep};
use crate::planner::{LlmPlanner, Planner, StaticPlanner};
use crate::runner::AgentRunner;

/// File that marks a directory as an exported agent.
pub const EXPORT_FILE: &str = "agent.json";

/// An agent packaged on disk: goal, plan template, and declared tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExport {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub goal: Goal,
    pub plan: Plan,
    /// Tools the plan expects. Any without a built-in implementation run as mocks.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Extra judge rules, merged with the default set.
    #[serde(default)]
    pub rules: Vec<EvaluationRule>,
    /// Fallback steps used when a step asks for a replan.
    #[serde(default)]
    pub recovery_steps: Vec<PlanStep>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Everything an export needs from the host to become a runnable agent.
#[derive(Clone, Default)]
pub struct RunnerOptions {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub config: ExecutorConfig,
    pub event_bus: Option<Arc<EventBus>>,
    /// Shared gate, so one reviewer can answer for several agents.
    pub approval_gate: Option<Arc<ApprovalGate>>,
}

/// Load an export from a directory containing `agent.json`, or from the file itself.
///
/// The plan is validated here so that a broken export never opens a run.
pub fn load_export(path: impl AsRef<Path>) -> Result<AgentExport> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join(EXPORT_FILE)
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(HiveError::ExportNotFound(file.display().to_string()));
    }

    let content = std::fs::read_to_string(&file)?;
    let mut export: AgentExport = serde_json::from_str(&content)
        .map_err(|e| HiveError::Validation(format!("{}: {}", file.display(), e)))?;
    export.path = file.parent().map(Path::to_path_buf).unwrap_or_default();

    if export.name.trim().is_empty() {
        return Err(HiveError::Validation(format!("{}: agent name is empty", file.display())));
    }
    if export.plan.goal_id.is_empty() {
        export.plan.goal_id = export.goal.id.clone();
    }
    if export.plan.description.is_empty() {
        export.plan.description = export.goal.description.clone();
    }
    if export.goal.name.is_empty() {
        export.goal.name = export.name.clone();
    }
    export
        .plan
        .validate()
        .map_err(|e| HiveError::Validation(format!("{}: {}", export.name, e)))?;

    debug!(
        agent = %export.name,
        steps = export.plan.steps.len(),
        tools = export.tools.len(),
        "Export loaded"
    );
    Ok(export)
}

/// Sub-directories of `root` that contain an export, sorted by path.
pub fn list_exports(root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(HiveError::ExportNotFound(root.display().to_string()));
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let dir = entry?.path();
        if dir.is_dir() && dir.join(EXPORT_FILE).is_file() {
            found.push(dir);
        }
    }
    found.sort();
    Ok(found)
}

/// Load every export under `root`.
pub fn load_all(root: impl AsRef<Path>) -> Result<Vec<AgentExport>> {
    list_exports(root)?.iter().map(|dir| load_export(dir)).collect()
}

impl AgentExport {
    /// Built-in tools plus every declared tool, mocked where no built-in exists.
    pub fn registry(&self) -> ToolRegistry {
        self.tools
            .iter()
            .cloned()
            .fold(
                hive_tools::builtin::register_all(ToolRegistry::builder()),
                |builder, def| builder.declare(def),
            )
            .build()
    }

    /// Wire the export into an executor and wrap it as an [`AgentRunner`].
    pub fn into_runner(self, options: RunnerOptions) -> AgentRunner {
        let tools: Arc<dyn ToolExecutor> = Arc::new(self.registry());

        let mut judge = self
            .rules
            .iter()
            .cloned()
            .fold(create_default_judge(), |judge, rule| judge.with_rule(rule));
        if let Some(llm) = &options.llm {
            judge = judge.with_llm(llm.clone());
        }

        let planner: Option<Arc<dyn Planner>> = if !self.recovery_steps.is_empty() {
            Some(Arc::new(StaticPlanner::new(self.recovery_steps.clone())))
        } else {
            options
                .llm
                .as_ref()
                .map(|llm| Arc::new(LlmPlanner::new(llm.clone()).with_tools(tools.definitions())) as Arc<dyn Planner>)
        };

        let mut builder = FlexibleExecutor::builder(tools).judge(judge).config(options.config);
        if let Some(llm) = &options.llm {
            builder = builder.llm(llm.clone());
        }
        if let Some(planner) = planner {
            builder = builder.planner(planner);
        }
        if let Some(bus) = options.event_bus {
            builder = builder.event_bus(bus);
        }
        if let Some(gate) = options.approval_gate {
            builder = builder.approval_gate(gate);
        }

        info!(agent = %self.name, path = %self.path.display(), "Agent ready");
        let mut runner = AgentRunner::new(self.name, self.goal, self.plan, builder.build())
            .with_description(self.description)
            .with_capabilities(self.capabilities)
            .with_priority(self.priority);
        if let Some(llm) = options.llm {
            runner = runner.with_assessor(llm);
        }
        runner
    }
}
