//! cmdq CLI: operator interface to the command queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cmdq::config::{Config, kinds_file_from_env};
use cmdq::config::secrets::ExposeSecret;
use cmdq::engine::{DispatchConfig, Dispatcher, ExecutorRegistry};
use cmdq::registry::KindRegistry;
use cmdq::store::PgCommandStore;
use cmdq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use cmdq::{CommandId, CommandModel, CommandQueueManager, Priority, Trigger};

#[derive(Parser)]
#[command(name = "cmdq", about = "In-process command queue")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Recover, then dispatch queued commands until Ctrl-C
    Serve {
        /// Kinds file (overrides CMDQ_KINDS_FILE)
        #[arg(long)]
        kinds: Option<PathBuf>,
        /// Maximum concurrent commands (overrides CMDQ_MAX_CONCURRENT)
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Push a command by kind name once the queue has recovered
        #[arg(long = "push", value_name = "KIND")]
        push: Vec<String>,
        /// Priority for --push commands
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },
    /// Show a command
    Show {
        /// Command id
        id: i64,
    },
    /// List started commands
    Started,
    /// List known command kinds
    Kinds {
        /// Kinds file (overrides CMDQ_KINDS_FILE)
        #[arg(long)]
        kinds: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Cmd::Serve {
            kinds,
            max_concurrent,
            push,
            priority,
        } => {
            let (config, _guard) = startup()?;
            let kinds = load_kinds(kinds.as_deref().or(config.kinds_file.as_deref()))?;
            let dispatch = DispatchConfig {
                poll_interval: config.poll_interval,
                max_concurrent: max_concurrent.unwrap_or(config.max_concurrent),
            };
            cmd_serve(&config, kinds, dispatch, push, priority).await
        }
        Cmd::Show { id } => {
            let (config, _guard) = startup()?;
            cmd_show(&config, CommandId(id)).await
        }
        Cmd::Started => {
            let (config, _guard) = startup()?;
            cmd_started(&config).await
        }
        Cmd::Kinds { kinds } => {
            let kinds = load_kinds(kinds.or_else(kinds_file_from_env).as_deref())?;
            cmd_kinds(&kinds);
            Ok(())
        }
    }
}

/// Load configuration and install telemetry for commands that use the store.
fn startup() -> anyhow::Result<(Config, TelemetryGuard)> {
    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "cmdq".to_string(),
        default_level: config.log_level.clone(),
    })?;
    Ok((config, guard))
}

fn load_kinds(path: Option<&Path>) -> anyhow::Result<KindRegistry> {
    match path {
        Some(path) => Ok(KindRegistry::load_from_file(path)?),
        None => Ok(KindRegistry::empty()),
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgCommandStore> {
    let store = PgCommandStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    Ok(store)
}

async fn cmd_serve(
    config: &Config,
    kinds: KindRegistry,
    dispatch: DispatchConfig,
    push: Vec<String>,
    priority: Priority,
) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let executors = ExecutorRegistry::from_kinds(&kinds);
    tracing::info!(
        kinds = kinds.len(),
        executors = executors.len(),
        "loaded command kinds"
    );

    let manager = Arc::new(CommandQueueManager::new(Arc::new(store), kinds));
    manager.ensure_recovered().await?;

    for name in &push {
        let model = manager
            .push_named(name, None, priority, Trigger::Manual)
            .await?;
        println!("Queued: {} {} (status: {})", model.id, model.name, model.status);
    }

    let dispatcher = Dispatcher::new(manager, Arc::new(executors), dispatch);

    let d = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        d.shutdown();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_show(config: &Config, id: CommandId) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let manager = CommandQueueManager::new(Arc::new(store), KindRegistry::empty());
    let command = manager.get(id).await?;

    println!("ID:         {}", command.id);
    println!("Name:       {}", command.name);
    println!("Status:     {}", command.status);
    println!("Priority:   {}", command.priority);
    println!("Trigger:    {}", command.trigger);
    println!(
        "Params:     {}",
        serde_json::to_string_pretty(&command.body.params)?
    );
    println!("Queued:     {}", command.queued_at);
    if let Some(started) = command.started_at {
        println!("Started:    {started}");
    }
    if let Some(ended) = command.ended_at {
        println!("Ended:      {ended}");
    }
    if let Some(ms) = command.duration_ms {
        println!("Duration:   {ms}ms");
    }
    if let Some(ref error) = command.exception {
        println!("Error:      {error}");
    }

    Ok(())
}

async fn cmd_started(config: &Config) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let manager = CommandQueueManager::new(Arc::new(store), KindRegistry::empty());
    let started = manager.get_started().await?;

    if started.is_empty() {
        println!("No started commands.");
        return Ok(());
    }

    println!("{:<8}  {:<24}  {:<8}  STARTED", "ID", "NAME", "PRI");
    println!("{}", "-".repeat(64));
    for command in &started {
        print_row(command);
    }
    println!("\n{} command(s)", started.len());
    Ok(())
}

fn print_row(command: &CommandModel) {
    println!(
        "{:<8}  {:<24}  {:<8}  {}",
        command.id,
        command.name,
        command.priority,
        command
            .started_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    );
}

fn cmd_kinds(kinds: &KindRegistry) {
    if kinds.is_empty() {
        println!("No command kinds configured.");
        return;
    }
    for entry in kinds.entries() {
        let hook = entry
            .hook()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<24}  {}", entry.name(), hook);
    }
}
