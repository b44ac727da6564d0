//! AgentDeck Server
//!
//! Headless service exposing PTY-backed agent sessions over WebSocket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use server::config::Config;
use server::launch::AgentProfile;
use server::session::{ArtifactStore, SessionRegistry};
use server::transport;

/// Seconds between orphan sweeps of the session registry.
const CLEANUP_INTERVAL_SECS: u64 = 30;

/// AgentDeck server - PTY-backed agent sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "agentdeck-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the server.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Bind address, overriding the configuration file
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// List agent launch profiles and their availability
    Agents {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // A --bind flag beats both the config file and the environment
    if let Commands::Serve { bind: Some(addr) } = &cli.command {
        config.server.bind_addr = addr.clone();
    }

    // Initialize tracing; --verbose beats the configured level, RUST_LOG
    // beats both
    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.clone()
    };
    let _guard = init_tracing(&default_level, config.server.log_dir.as_deref());

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => {
            run_serve(config).await?;
        }
        Commands::Agents { json } => {
            print_agents(&config, json)?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// Returns a guard that must stay alive for the duration of the program
/// when file logging is enabled.
fn init_tracing(
    default_level: &str,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agentdeck-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Run the WebSocket server until a shutdown signal arrives.
async fn run_serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("AgentDeck server starting...");

    let artifact_dir = match &config.artifact.temp_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create artifact directory: {}", dir.display())
            })?;
            dir.clone()
        }
        None => std::env::temp_dir(),
    };
    let artifacts = ArtifactStore::with_limits(artifact_dir, config.artifact.max_decoded_bytes);

    let registry = Arc::new(SessionRegistry::with_settings(
        artifacts,
        config.session.default_shell.clone(),
        config.session.max_sessions,
        Duration::from_secs(config.session.orphan_ttl_secs),
    ));
    registry.start_cleanup_task(CLEANUP_INTERVAL_SECS);

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    tracing::info!(
        max_sessions = config.session.max_sessions,
        "Listening on ws://{}",
        listener.local_addr()?
    );

    let accept_registry = Arc::clone(&registry);
    let accept_loop = tokio::spawn(async move {
        transport::serve(listener, accept_registry).await;
    });

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    accept_loop.abort();
    registry.shutdown_all().await;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Print agent launch profiles, either as a table or JSON.
fn print_agents(config: &Config, json: bool) -> anyhow::Result<()> {
    let shell = config.session.default_shell.as_deref();

    if json {
        let entries: Vec<serde_json::Value> = AgentProfile::all()
            .iter()
            .map(|profile| {
                serde_json::json!({
                    "id": profile.kind.id(),
                    "name": profile.display_name,
                    "description": profile.description,
                    "program": profile.resolve_program(shell),
                    "available": profile.is_available(shell),
                    "supports_images": profile.supports_images,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    print_agents_table(shell);
    Ok(())
}

/// Print agent profiles in a formatted ASCII table.
fn print_agents_table(default_shell: Option<&str>) {
    let profiles = AgentProfile::all();

    // Calculate column widths
    let id_width = profiles
        .iter()
        .map(|p| p.kind.id().len())
        .max()
        .unwrap_or(2)
        .max(2);
    let program_width = profiles
        .iter()
        .map(|p| p.resolve_program(default_shell).len())
        .max()
        .unwrap_or(7)
        .max(7);

    // Print header
    println!(
        "{:<id_width$}  {:<program_width$}  {:>9}  DESCRIPTION",
        "ID",
        "PROGRAM",
        "AVAILABLE",
        id_width = id_width,
        program_width = program_width
    );
    println!("{}", "-".repeat(id_width + program_width + 26));

    // Print rows
    for profile in profiles {
        println!(
            "{:<id_width$}  {:<program_width$}  {:>9}  {}",
            profile.kind.id(),
            profile.resolve_program(default_shell),
            if profile.is_available(default_shell) {
                "yes"
            } else {
                "no"
            },
            profile.description,
            id_width = id_width,
            program_width = program_width
        );
    }

    println!();
    println!("Total: {} profile(s)", profiles.len());
}
