// ABOUTME: Main entry point for the roombridge binary
// ABOUTME: Parses flags, loads config, sets up logging and signals, then runs the bridge supervisor

use clap::Parser;
use roombridge::{logging, MatrixTransport};
use roombridge_core::config::{Config, Overrides};
use roombridge_agent::AgentRegistry;
use roombridge_core::{paths, BridgeError, BridgeOutcome, BridgeSupervisor, WorkingDirectory};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "roombridge")]
#[command(version, about = "Bridge a Matrix room to a coding agent working in this directory")]
struct Cli {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Working directory to serve (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Agent model override
    #[arg(long)]
    model: Option<String>,

    /// Emit stderr logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! roombridge crashed with the following error:      ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = match Config::load(&Overrides {
        config_path: cli.config,
        working_dir: cli.workdir,
        model: cli.model,
    }) {
        Ok(config) => config,
        Err(e) => return exit_with(BridgeOutcome::Failed(e)),
    };

    let state_dir = config.bridge.state_dir();
    let _log_guard = match logging::init(&paths::log_dir(&state_dir), cli.json_logs) {
        Ok(guard) => guard,
        Err(e) => return exit_with(BridgeOutcome::Failed(BridgeError::configuration(e))),
    };

    tracing::info!(
        homeserver = %config.matrix.home_server,
        user_id = %config.matrix.user_id,
        admin_user = %config.matrix.admin_user,
        backend = %config.agent.backend,
        model = %config.agent.model,
        state_dir = %state_dir.display(),
        "Configuration loaded"
    );

    let directory = match config.bridge.working_dir().and_then(WorkingDirectory::new) {
        Ok(directory) => directory,
        Err(e) => return exit_with(BridgeOutcome::Failed(BridgeError::configuration(e))),
    };

    let registry = AgentRegistry::default();
    let settings = config.agent.backend_settings(directory.path());
    let agent = match registry.create(&config.agent.backend, &settings) {
        Ok(agent) => agent,
        Err(e) => return exit_with(BridgeOutcome::Failed(BridgeError::configuration(e))),
    };
    tracing::info!(backend = agent.name(), directory = %directory, "Agent backend ready");

    let transport = Arc::new(MatrixTransport::new(config.matrix.clone(), &state_dir));
    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let outcome = BridgeSupervisor::new(config, transport, agent)
        .run(shutdown)
        .await;
    exit_with(outcome)
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn forward_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down gracefully..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down gracefully..."),
    }
    shutdown.cancel();
}

fn exit_with(outcome: BridgeOutcome) -> ExitCode {
    if let BridgeOutcome::Failed(e) = &outcome {
        eprintln!("error: {}", e);
    }
    let code = outcome.exit_code();
    tracing::info!(exit_code = code, "roombridge exiting");
    ExitCode::from(code as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = Cli::parse_from([
            "roombridge",
            "--config",
            "/etc/roombridge.toml",
            "--workdir",
            "/srv/proj",
            "--model",
            "opus",
            "--json-logs",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/roombridge.toml")));
        assert_eq!(cli.workdir, Some(PathBuf::from("/srv/proj")));
        assert_eq!(cli.model.as_deref(), Some("opus"));
        assert!(cli.json_logs);
    }

    #[test]
    fn test_unknown_backend_is_reported_with_choices() {
        let err = AgentRegistry::default()
            .create("telepathy", &serde_json::json!({}))
            .err()
            .unwrap();
        let outcome = BridgeOutcome::Failed(BridgeError::configuration(err));
        assert_eq!(outcome.exit_code(), 2);
        assert!(format!("{:?}", outcome).contains("direct, mock"));
    }
}
