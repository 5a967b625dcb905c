use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hive_core::approval::{ApprovalRequest, ApprovalResult};
use hive_core::config::{AppConfig, ModelConfig};
use hive_core::event::EventBus;
use hive_core::traits::LlmProvider;
use hive_core::types::RuntimeEvent;

use hive_agent::{
    load_export, AgentOrchestrator, AgentRunner, ApprovalGate, ExecutionStatus, OrchestratorResult,
    PlanExecutionResult, RunLogger, RunnerOptions,
};

#[derive(Parser)]
#[command(name = "hive", version, about = "Goal-driven agent runtime with an auditable decision log")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an exported agent once
    Run {
        /// Export directory (or its agent.json)
        export: PathBuf,
        /// Input as JSON; plain text is passed as a string
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// Approve every request without prompting
        #[arg(long)]
        auto_approve: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show an agent's goal, steps and tools
    Info {
        export: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check an export without running it
    Validate { export: PathBuf },
    /// List the exports under a directory
    List {
        #[arg(default_value = "exports")]
        dir: PathBuf,
    },
    /// Route a request to the best agent under a directory
    Dispatch {
        /// Directory of exports
        dir: PathBuf,
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// What the request is for; defaults to the input text
        #[arg(long)]
        intent: Option<String>,
        /// Skip negotiation and send straight to this agent
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        auto_approve: bool,
        #[arg(long)]
        json: bool,
    },
    /// Interactive session with one agent
    Shell {
        export: PathBuf,
        #[arg(long)]
        auto_approve: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    let ok = match cli.command {
        Commands::Run {
            export,
            input,
            auto_approve,
            json,
        } => cmd_run(&config, &export, &input, auto_approve, json).await?,
        Commands::Info { export, json } => cmd_info(&export, json)?,
        Commands::Validate { export } => cmd_validate(&export)?,
        Commands::List { dir } => cmd_list(&dir)?,
        Commands::Dispatch {
            dir,
            input,
            intent,
            agent,
            auto_approve,
            json,
        } => {
            cmd_dispatch(&config, &dir, &input, intent, agent.as_deref(), auto_approve, json).await?
        }
        Commands::Shell {
            export,
            auto_approve,
        } => cmd_shell(&config, &export, auto_approve).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_run(
    config: &AppConfig,
    export: &Path,
    input: &str,
    auto_approve: bool,
    json: bool,
) -> anyhow::Result<bool> {
    let input = parse_input(input);
    let event_bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(event_bus.clone()));
    let runner = load_runner(config, export, &event_bus, &gate)?;

    let approver = spawn_approver(&event_bus, gate, auto_approve);
    let logger = spawn_run_log(config, &event_bus);

    let result = runner.run(input).await;
    approver.abort();
    finish_run_log(logger).await;

    let result = result?;
    print_execution(&result, json)?;
    Ok(result.is_success())
}

fn cmd_info(export: &Path, json: bool) -> anyhow::Result<bool> {
    let runner = load_export(export)?.into_runner(RunnerOptions::default());
    let info = runner.info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(true);
    }

    println!("{}", info.name);
    if !info.description.is_empty() {
        println!("  {}", info.description);
    }
    println!("Goal: {}", info.goal_description);
    if !info.capabilities.is_empty() {
        println!("Capabilities: {}", info.capabilities.join(", "));
    }
    println!("Priority: {}", info.priority);
    for criterion in &info.success_criteria {
        println!("  criterion: {}", criterion);
    }
    for constraint in &info.constraints {
        println!("  constraint: {}", constraint);
    }
    println!("Steps:");
    for step in &info.steps {
        let deps = if step.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (after {})", step.dependencies.join(", "))
        };
        let gate = if step.requires_approval { " [approval]" } else { "" };
        println!("  {} [{}]{}{}: {}", step.id, step.action_type, gate, deps, step.description);
    }
    println!("Tools: {}", info.tools.join(", "));
    Ok(true)
}

fn cmd_validate(export: &Path) -> anyhow::Result<bool> {
    let export = match load_export(export) {
        Ok(e) => e,
        Err(e) => {
            println!("invalid: {}", e);
            return Ok(false);
        }
    };
    let name = export.name.clone();
    let report = export.into_runner(RunnerOptions::default()).validate();

    for error in &report.errors {
        println!("error: {}", error);
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    if report.valid {
        println!("{}: valid", name);
    } else {
        println!("{}: {} error(s)", name, report.errors.len());
    }
    Ok(report.valid)
}

fn cmd_list(dir: &Path) -> anyhow::Result<bool> {
    let paths = hive_agent::list_exports(dir)?;
    if paths.is_empty() {
        println!("No exports under {}", dir.display());
        return Ok(true);
    }
    let mut ok = true;
    for path in paths {
        match load_export(&path) {
            Ok(export) => {
                println!(
                    "{:<24} {:>3}  {:<30} {}",
                    export.name,
                    export.priority,
                    truncate(&export.capabilities.join(","), 30),
                    truncate(&export.description, 60)
                );
            }
            Err(e) => {
                ok = false;
                println!("{:<24} error: {}", path.display(), e);
            }
        }
    }
    Ok(ok)
}

async fn cmd_dispatch(
    config: &AppConfig,
    dir: &Path,
    input: &str,
    intent: Option<String>,
    agent: Option<&str>,
    auto_approve: bool,
    json: bool,
) -> anyhow::Result<bool> {
    let request = parse_input(input);
    let intent = intent.unwrap_or_else(|| match &request {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let event_bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(event_bus.clone()));
    let options = runner_options(config, &event_bus, &gate)?;

    let mut builder = AgentOrchestrator::builder()
        .config(config.orchestrator.clone())
        .event_bus(event_bus.clone());
    for export in hive_agent::export::load_all(dir)? {
        builder = builder.register_runner(export.into_runner(options.clone()));
    }
    let orchestrator = builder.build()?;
    if orchestrator.agents().is_empty() {
        anyhow::bail!("no agents under {}", dir.display());
    }

    let approver = spawn_approver(&event_bus, gate, auto_approve);
    let result = match agent {
        Some(name) => orchestrator.dispatch_to(name, request, &intent).await,
        None => Ok(orchestrator.dispatch(request, &intent).await),
    };
    approver.abort();

    let result = result?;
    print_dispatch(&result, json)?;
    Ok(result.success)
}

async fn cmd_shell(config: &AppConfig, export: &Path, auto_approve: bool) -> anyhow::Result<bool> {
    let event_bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(event_bus.clone()));
    let runner = load_runner(config, export, &event_bus, &gate)?;
    let approver = spawn_approver(&event_bus, gate, auto_approve);

    println!("Hive v{}", env!("CARGO_PKG_VERSION"));
    println!("Agent: {} ({})", runner.name(), runner.goal().description);
    println!("Type a request (JSON or text), /help for commands, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut runs = 0usize;
    let mut completed = 0usize;

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" | "/q" => break,
            "/help" => {
                println!("/info    show the agent");
                println!("/check   validate the agent");
                println!("/stats   runs so far");
                println!("/quit    exit");
                continue;
            }
            "/info" => {
                println!("{}", serde_json::to_string_pretty(&runner.info())?);
                continue;
            }
            "/check" => {
                let report = runner.validate();
                println!("{}", serde_json::to_string_pretty(&report)?);
                continue;
            }
            "/stats" => {
                println!("{} run(s), {} completed", runs, completed);
                continue;
            }
            cmd if cmd.starts_with('/') => {
                println!("Unknown command: {}", cmd);
                continue;
            }
            _ => {}
        }

        let logger = spawn_run_log(config, &event_bus);
        let result = runner.run(parse_input(line)).await;
        finish_run_log(logger).await;
        runs += 1;

        match result {
            Ok(result) => {
                if result.is_success() {
                    completed += 1;
                }
                print_execution(&result, false)?;
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    approver.abort();
    println!("Goodbye!");
    Ok(true)
}

/// Model settings from config, or a default Anthropic model when only the
/// API key is in the environment.
fn model_config(config: &AppConfig) -> Option<ModelConfig> {
    if let Some(model) = &config.model {
        return Some(model.clone());
    }
    std::env::var("ANTHROPIC_API_KEY").ok().map(|key| ModelConfig {
        api_key: Some(key),
        ..ModelConfig::default()
    })
}

fn runner_options(
    config: &AppConfig,
    event_bus: &Arc<EventBus>,
    gate: &Arc<ApprovalGate>,
) -> anyhow::Result<RunnerOptions> {
    let llm: Option<Arc<dyn LlmProvider>> = match model_config(config) {
        Some(model) => Some(hive_llm::create_provider(&model)?),
        None => {
            warn!("No model configured; llm_query steps will fail");
            None
        }
    };
    Ok(RunnerOptions {
        llm,
        config: config.executor.clone(),
        event_bus: Some(event_bus.clone()),
        approval_gate: Some(gate.clone()),
    })
}

fn load_runner(
    config: &AppConfig,
    export: &Path,
    event_bus: &Arc<EventBus>,
    gate: &Arc<ApprovalGate>,
) -> anyhow::Result<AgentRunner> {
    let export = load_export(export)?;
    let runner = export.into_runner(runner_options(config, event_bus, gate)?);
    let report = runner.validate();
    for warning in &report.warnings {
        warn!(agent = %runner.name(), "{}", warning);
    }
    if !report.valid {
        anyhow::bail!("{} is invalid: {}", runner.name(), report.errors.join("; "));
    }
    Ok(runner)
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_input(input: &str) -> serde_json::Value {
    serde_json::from_str(input).unwrap_or_else(|_| serde_json::Value::String(input.to_string()))
}

/// Answer approval requests from the terminal, or approve all of them.
fn spawn_approver(event_bus: &EventBus, gate: Arc<ApprovalGate>, auto_approve: bool) -> JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let RuntimeEvent::ApprovalRequested { request } = event else {
                continue;
            };
            eprintln!(
                "\n[APPROVAL] step {} ({}): \"{}\"",
                request.step_id, request.risk, request.rationale
            );
            let result = if auto_approve {
                eprintln!("[auto-approved]");
                ApprovalResult::approve(&request.correlation_id)
            } else {
                match tokio::task::spawn_blocking(move || prompt_approval(&request)).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(error = %e, "Approval prompt failed");
                        continue;
                    }
                }
            };
            gate.resolve(result).await;
        }
    })
}

fn prompt_approval(request: &ApprovalRequest) -> ApprovalResult {
    if !request.preview.is_null() {
        eprintln!("{}", serde_json::to_string_pretty(&request.preview).unwrap_or_default());
    }
    let options = ["approve", "reject", "modify parameters"];
    let choice = dialoguer::Select::new()
        .with_prompt("Decision")
        .items(&options[..])
        .default(0)
        .interact()
        .unwrap_or(1);

    match choice {
        0 => ApprovalResult::approve(&request.correlation_id),
        2 => {
            let params: String = dialoguer::Input::new()
                .with_prompt("Parameters (JSON)")
                .interact_text()
                .unwrap_or_default();
            match serde_json::from_str(&params) {
                Ok(params) => ApprovalResult::modify(&request.correlation_id, params),
                Err(e) => ApprovalResult::reject(&request.correlation_id, format!("bad parameters: {}", e)),
            }
        }
        _ => {
            let reason: String = dialoguer::Input::new()
                .with_prompt("Reason")
                .allow_empty(true)
                .interact_text()
                .unwrap_or_default();
            ApprovalResult::reject(&request.correlation_id, reason)
        }
    }
}

fn spawn_run_log(
    config: &AppConfig,
    event_bus: &EventBus,
) -> Option<(JoinHandle<Option<PathBuf>>, CancellationToken)> {
    let log = config.log.as_ref().filter(|l| l.enabled)?;
    let cancel = CancellationToken::new();
    let handle = RunLogger::new(log.resolved_dir(), log.level).spawn(event_bus, None, cancel.clone());
    Some((handle, cancel))
}

async fn finish_run_log(logger: Option<(JoinHandle<Option<PathBuf>>, CancellationToken)>) {
    let Some((mut handle, cancel)) = logger else {
        return;
    };
    let path = match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
        Ok(joined) => joined.ok().flatten(),
        Err(_) => {
            cancel.cancel();
            handle.await.ok().flatten()
        }
    };
    if let Some(path) = path {
        info!(path = %path.display(), "Run log written");
    }
}

fn print_execution(result: &PlanExecutionResult, json: bool) -> anyhow::Result<()> {
    let summary = result.summary();
    if json {
        let value = serde_json::json!({
            "status": result.status.to_string(),
            "output": result.output(),
            "feedback": result.feedback,
            "summary": summary,
            "pending_approval": result.pending_approval,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Run {}: {}", summary.run_id, result.status);
    if !result.output().is_null() {
        println!("{}", serde_json::to_string_pretty(result.output())?);
    }
    if let Some(feedback) = &result.feedback {
        println!("Feedback: {}", feedback);
    }
    println!(
        "Decisions: {} ({} ok, {} failed), {}ms",
        summary.total_decisions, summary.successful_decisions, summary.failed_decisions, summary.duration_ms
    );
    for problem in &summary.problems {
        println!("  problem: {}", problem);
    }
    if result.status == ExecutionStatus::AwaitingApproval {
        if let Some(req) = &result.pending_approval {
            println!("Waiting for approval of step {} ({})", req.step_id, req.correlation_id);
        }
    }
    Ok(())
}

fn print_dispatch(result: &OrchestratorResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if result.success {
        println!("Handled by: {}", result.handled_by.join(" -> "));
    } else {
        println!("Dispatch failed: {}", result.error.as_deref().unwrap_or("unknown error"));
    }
    for (agent, output) in &result.results {
        println!("[{}] {}", agent, serde_json::to_string_pretty(output)?);
    }
    for problem in &result.problems {
        println!("  problem ({:?}): {}", problem.kind, problem.message);
    }
    println!("Messages: {}", result.messages.len());
    for message in &result.messages {
        println!(
            "  {} {:<20} {} -> {}",
            message.id,
            message.message_type.to_string(),
            message.from_agent.as_deref().unwrap_or("user"),
            message.to_agent.as_deref().unwrap_or("*"),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
