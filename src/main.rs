use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use rivulet::logger::init_tracing;
use rivulet::schema::write_schema;
use rivulet::watcher::StorageWatcher;
use rivulet::{FlowConfig, Runtime, api};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rivulet", about = "Flow-based automation engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine and admin api
    Run(RunArgs),

    /// Emit JSON Schemas into `<root>/schemas`
    Schema,

    /// Initialize a fresh storage layout
    Init,

    /// Inspect flow files without running them
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Admin api bind address
    #[arg(long, default_value = "127.0.0.1:1880")]
    listen: String,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write JSON logs under `<root>/logs`
    #[arg(long, default_value_t = true)]
    log_to_file: bool,

    /// Redeploy automatically when the flows file changes on disk
    #[arg(long, default_value_t = true)]
    watch: bool,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Check that a flows file is well-formed and references known types
    Validate { file: PathBuf },
}

/// Resolve the storage root from the environment or use the default.
fn resolve_root_dir() -> PathBuf {
    match env::var("RIVULET_ROOT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("./rivulet"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        listen: "127.0.0.1:1880".to_string(),
        log_level: "info".to_string(),
        log_to_file: true,
        watch: true,
    })) {
        Commands::Run(args) => run(root, args).await,
        Commands::Schema => {
            init_tracing("info", None)?;
            write_schema(&root.join("schemas"))
        }
        Commands::Init => {
            init_tracing("info", None)?;
            init_layout(&root)
        }
        Commands::Flow(flow) => {
            init_tracing("warn", None)?;
            match flow.command {
                FlowCommands::Validate { file } => validate_file(&file),
            }
        }
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let log_dir = args.log_to_file.then(|| root.join("logs"));
    let _log_guard = init_tracing(&args.log_level, log_dir.as_deref())?;
    fs::create_dir_all(&root)
        .with_context(|| format!("creating storage root {}", root.display()))?;

    let runtime = Runtime::new(&root);
    runtime.start().await?;

    let watcher = if args.watch {
        Some(StorageWatcher::spawn(
            runtime.storage().clone(),
            runtime.deploys().clone(),
        )?)
    } else {
        None
    };

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding admin api to {}", args.listen))?;
    let state = runtime.api_state();

    tokio::select! {
        result = api::serve(listener, state) => {
            if let Err(e) = result {
                error!(%e, "admin api terminated");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    runtime.shutdown().await;
    Ok(())
}

fn init_layout(root: &PathBuf) -> anyhow::Result<()> {
    fs::create_dir_all(root.join("library"))?;
    fs::create_dir_all(root.join("logs"))?;
    let flows = root.join("flows.json");
    if !flows.exists() {
        fs::write(&flows, "[]\n")?;
    }
    write_schema(&root.join("schemas"))?;
    info!(root = %root.display(), "storage layout initialized");
    Ok(())
}

fn validate_file(file: &PathBuf) -> anyhow::Result<()> {
    let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let config = FlowConfig::from_value(value)?;

    let registry = rivulet::nodes::builtin_registry();
    if let Err(e) = rivulet::flow::validate_config(&config, &registry) {
        bail!("{}: {e}", file.display());
    }
    println!(
        "{}: {} nodes, rev {}",
        file.display(),
        config.nodes.len(),
        config.rev()
    );
    Ok(())
}
