//! Command handlers.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use crate::agent_loop::{
    Orchestrator, RunEvent, RunEventPayload, RunEventSink, TaskOutcome, TaskRequest,
};
use crate::config::ToolMeshConfig;
use crate::decision::ChatDecisionMaker;
use crate::error::{Result, ToolMeshError};
use crate::mcp::aggregate::{MultiServerClient, ServerStatus};
use crate::util::timeout::Deadline;

use super::{CallArgs, Cli, Commands, RunArgs};

/// Install the stderr fmt subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,toolmesh=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    config.ensure_required_servers_parsed()?;
    let client = Arc::new(MultiServerClient::initialize(&config).await?);

    let result = match cli.command {
        Commands::Tools => list_tools(&client, cli.json).await,
        Commands::Servers => list_servers(&client, cli.json).await,
        Commands::Call(args) => call_tool(&client, args, cli.json).await,
        Commands::Run(args) => run_tasks(Arc::clone(&client), &config, args, cli.json).await,
    };

    for (server, error) in client.shutdown().await {
        tracing::warn!(server = %server, error = %error, "shutdown reported an error");
    }
    result
}

fn load_config(path: Option<&Path>) -> Result<ToolMeshConfig> {
    match path {
        Some(path) => ToolMeshConfig::load(path),
        None => ToolMeshConfig::discover(),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn list_tools(client: &MultiServerClient, json: bool) -> Result<ExitCode> {
    let catalog = client.get_tools().await?;
    if json {
        print_json(&*catalog)?;
        return Ok(ExitCode::SUCCESS);
    }
    for entry in catalog.tools() {
        println!(
            "{:<28} {:<12} {}",
            entry.exposed_name,
            entry.server_id(),
            entry.descriptor.description
        );
    }
    for shadowed in catalog.shadowed() {
        println!(
            "  (shadowed) {}/{} hidden by {}",
            shadowed.server_id, shadowed.tool_name, shadowed.owner
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn list_servers(client: &MultiServerClient, json: bool) -> Result<ExitCode> {
    if let Err(error) = client.get_tools().await {
        tracing::warn!(error = %error, "catalog refresh failed");
    }
    let statuses = client.server_statuses();
    if json {
        let rows: Vec<_> = statuses
            .iter()
            .map(|(id, status)| {
                serde_json::json!({
                    "id": id,
                    "required": client.is_required(id),
                    "status": status,
                })
            })
            .collect();
        print_json(&rows)?;
        return Ok(ExitCode::SUCCESS);
    }
    for (id, status) in &statuses {
        match status {
            ServerStatus::Live => println!("{id:<16} live"),
            ServerStatus::Degraded { reason } => println!("{id:<16} degraded: {reason}"),
            ServerStatus::Closed => println!("{id:<16} closed"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn call_tool(client: &MultiServerClient, args: CallArgs, json: bool) -> Result<ExitCode> {
    let arguments: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| ToolMeshError::InvalidArgument(format!("--args is not valid JSON: {e}")))?;
    client.get_tools().await?;
    let deadline = args
        .timeout_ms
        .map(Deadline::after_ms)
        .unwrap_or_else(|| client.default_call_deadline());

    let result = client.call_tool(&args.tool, arguments, deadline).await?;
    if json {
        print_json(&result)?;
    } else if result.is_success() {
        println!("{}", result.payload_text());
    } else {
        eprintln!("{} ({}): {}", result.tool_name, result.server_id, result.payload_text());
    }
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_tasks(
    client: Arc<MultiServerClient>,
    config: &ToolMeshConfig,
    args: RunArgs,
    json: bool,
) -> Result<ExitCode> {
    let tasks: Vec<TaskRequest> = match args.task {
        Some(description) => {
            let mut task = TaskRequest::new(description);
            task.task_type = args.task_type;
            vec![task]
        }
        None => config
            .tasks
            .iter()
            .map(|entry| {
                let mut task = TaskRequest::new(&entry.description);
                task.task_type = entry.task_type.clone();
                task
            })
            .collect(),
    };
    if tasks.is_empty() {
        return Err(ToolMeshError::InvalidArgument(
            "no task given and the config lists no [[tasks]]".into(),
        ));
    }

    let decision_maker = Arc::new(ChatDecisionMaker::from_config(&config.decision)?);
    let mut orchestrator = Orchestrator::new(client, decision_maker, config.agent.clone());
    if !json {
        orchestrator = orchestrator.with_event_sink(progress_sink());
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        let description = task.description.clone();
        let outcome = orchestrator.run(task).await;
        if !json {
            print_outcome(&description, &outcome);
        }
        outcomes.push(outcome);
    }

    if json {
        print_json(&outcomes)?;
    }
    Ok(if outcomes.iter().all(TaskOutcome::is_completed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn progress_sink() -> RunEventSink {
    Arc::new(|event: RunEvent| match &event.payload {
        RunEventPayload::ToolCallStarted { request } => {
            eprintln!("  -> {} {}", request.tool_name, request.arguments);
        }
        RunEventPayload::ToolCallFinished { result, .. } => {
            eprintln!("  <- {} ({}ms)", truncate(&result.payload_text(), 200), result.elapsed_ms);
        }
        _ => {}
    })
}

fn print_outcome(description: &str, outcome: &TaskOutcome) {
    println!("task: {description}");
    match (&outcome.answer, &outcome.error) {
        (Some(answer), _) => println!("answer: {answer}"),
        (None, Some(error)) => println!("failed: {error}"),
        (None, None) => println!("canceled"),
    }
    println!("steps: {} ({} failed)\n", outcome.session.len(), outcome.session.failures());
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
