//! `datalab` command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lab_config::LabConfig;
use lab_kernel::{Dispatcher, Supervisor};
use lab_registry::DataRegistry;
use tokio::io::BufReader;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "datalab", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve newline-delimited JSON tool calls on stdin and answer on stdout.
    Serve {
        /// TOML configuration file; defaults apply when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        /// TOML configuration file; defaults apply when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run one script request read from stdin.
    #[command(hide = true)]
    Worker,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        // Runs before any runtime or subscriber exists so the address-space
        // ceiling only has to cover the interpreter.
        Command::Worker => {
            let code = lab_sandbox::worker::run_stdio();
            return ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX));
        }
        Command::Config { config } => print_config(config),
        Command::Serve { config } => serve(config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("datalab: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = LabConfig::load(path.as_deref())?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

fn serve(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = LabConfig::load(path.as_deref())?;
    lab_telemetry::init_tracing(&config.logging.level, config.logging.format)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: LabConfig) -> anyhow::Result<()> {
    let registry = Arc::new(
        DataRegistry::open(config.registry_config()).context("failed to open data registry")?,
    );
    let policy = config.security_policy()?;
    let current_exe = std::env::current_exe().context("cannot locate the datalab binary")?;
    let supervisor = Arc::new(Supervisor::new(config.supervisor_config(&current_exe)?));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        policy,
        Arc::clone(&supervisor) as Arc<dyn lab_kernel::CodeExecutor>,
        config.query_config(),
    )
    .context("failed to build dispatcher")?;

    info!(
        session = %registry.session_dir().display(),
        max_concurrency = config.limits.max_concurrency,
        "datalab serving on stdin/stdout"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        served = dispatcher.serve(stdin, stdout) => served.context("transport failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
    }

    supervisor.close();
    let session_dir = registry.session_dir().to_path_buf();
    drop(dispatcher);
    // The registry removes its session directory on drop.
    drop(registry);
    if let Err(err) = tokio::fs::remove_dir_all(&session_dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(session = %session_dir.display(), %err, "failed to remove session directory");
    }
    Ok(())
}
