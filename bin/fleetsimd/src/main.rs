//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the fleet simulator daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleetsim_common::config::AppConfig;
use fleetsim_common::logging::{init_tracing, LogFormat, LogStream};
use fleetsim_metrics::{new_registry, spawn_http_server, FleetMetrics, MetricsServer};
use fleetsim_sim::{Command, ControlSession, Engine, TelemetrySampler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Equipment fleet electrical simulator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the stdout log format")]
    log_format: Option<CliLogFormat>,

    #[arg(long, help = "Refuse start, stop and emergency commands on the console")]
    read_only: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl Commands {
    /// Console stream for log output while this command runs.
    ///
    /// Commands that print JSON on stdout move log output to stderr.
    fn log_stream(self, configured: LogStream) -> LogStream {
        match self {
            Commands::Run | Commands::Snapshot => LogStream::Stderr,
            Commands::CheckConfig => configured,
        }
    }
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    #[command(about = "Run the simulator with the operator console on stdin")]
    Run,
    #[command(about = "Print the initial fleet snapshot as JSON and exit")]
    Snapshot,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/fleetsim.toml"));
    candidates.push(PathBuf::from("configs/fleetsim.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();

    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    if cli.read_only {
        config.control.can_control = false;
    }
    let command = cli.command.unwrap_or(Commands::Run);
    config.logging.stream = command.log_stream(config.logging.stream);
    init_tracing("fleetsimd", &config.logging)?;
    info!(
        source = %loaded.source.display(),
        elapsed_ms = load_duration.as_millis() as u64,
        equipment = config.effective_fleet().len(),
        "configuration loaded"
    );

    match command {
        Commands::Run => run_daemon(config).await?,
        Commands::Snapshot => {
            let engine = Engine::from_config(&config, None);
            println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
        }
        Commands::CheckConfig => {
            println!("configuration OK: {}", loaded.source.display());
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let (metrics, metrics_server) = if metrics_settings.enabled {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone())?;
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        let server = spawn_http_server(registry, metrics_settings.listen)?;
        (Some(metrics), Some(server))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let engine = Engine::from_config(&config, metrics);
    let (shutdown_tx, _) = broadcast::channel(1);
    let sampler = tokio::spawn(TelemetrySampler::new(engine.clone()).run(shutdown_tx.subscribe()));

    let session = ControlSession::new(engine.clone(), config.control.can_control);
    info!(
        can_control = session.can_control(),
        "simulator running; reading operator commands from stdin"
    );

    tokio::select! {
        result = operator_console(&session) => {
            result?;
            info!("operator console closed; shutting down");
        }
        result = signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(err) = sampler.await {
        warn!(error = %err, "sampler task ended abnormally");
    }
    engine.shutdown();
    shutdown_metrics(metrics_server).await
}

async fn shutdown_metrics(server: Option<MetricsServer>) -> Result<()> {
    if let Some(server) = server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Read one command per line and print each outcome as a JSON line.
async fn operator_console(session: &ControlSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(command) => match session.execute(command) {
                Ok(outcome) => serde_json::to_value(&outcome)?,
                Err(err) => serde_json::json!({
                    "error": err.to_string(),
                    "reason": err.reason(),
                }),
            },
            Err(err) => serde_json::json!({
                "error": err.to_string(),
                "reason": "parse",
            }),
        };
        println!("{reply}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_printing_commands_log_to_stderr() {
        assert_eq!(Commands::Run.log_stream(LogStream::Stdout), LogStream::Stderr);
        assert_eq!(Commands::Snapshot.log_stream(LogStream::Stdout), LogStream::Stderr);
        assert_eq!(
            Commands::CheckConfig.log_stream(LogStream::Stdout),
            LogStream::Stdout
        );
    }

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["fleetsimd", "--read-only"]).unwrap();
        assert!(cli.read_only);
        assert_eq!(cli.command.unwrap_or(Commands::Run), Commands::Run);
    }
}
