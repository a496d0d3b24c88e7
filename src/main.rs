use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sidecar::agent::Agent;
use sidecar::backends::registry::BackendRegistry;
use sidecar::config::{default_config_path, expand_parameters, load_agent_config};
use sidecar::services::{control, detect_service_manager, ServiceAction, ServiceDefinition};

const SERVICE_NAME: &str = "sidecar";

#[derive(Parser)]
#[command(name = "sidecar")]
#[command(
    about = "Host agent that supervises log collectors and keeps their configuration in sync with a central server"
)]
#[command(version)]
struct Cli {
    /// Configuration file (default: /etc/sidecar/sidecar.yml if exists, otherwise ~/.config/sidecar/sidecar.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run,
    /// Validate the configuration file and exit
    CheckConfig,
    /// List the registered backend types
    Backends,
    /// Manage the sidecar OS service
    Service {
        #[arg(value_enum)]
        action: ServiceAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Run => {
            info!("Starting sidecar with config: {}", config_path.display());
            let config = load_agent_config(&config_path)?;
            let mut agent = Agent::new(config)?;
            if let Err(e) = agent.run_until_shutdown().await {
                error!("Agent stopped with error: {:#}", e);
                return Err(e);
            }
            info!("Sidecar stopped");
        }
        Commands::CheckConfig => {
            let config = load_agent_config(&config_path)?;
            config.validate()?;
            for backend in &config.backends {
                BackendRegistry::resolve(&backend.backend_type)
                    .with_context(|| format!("Backend {}", backend.id))?;
                let path =
                    backend.resolved_configuration_path(&config.collector_configuration_directory);
                expand_parameters(&backend.execute_parameters, &path)
                    .with_context(|| format!("Backend {} execute_parameters", backend.id))?;
                expand_parameters(&backend.validation_parameters, &path)
                    .with_context(|| format!("Backend {} validation_parameters", backend.id))?;
            }
            println!(
                "Configuration OK: {} ({} backend(s))",
                config_path.display(),
                config.backends.len()
            );
        }
        Commands::Backends => {
            for name in BackendRegistry::registered_names() {
                println!("{}", name);
            }
        }
        Commands::Service { action } => {
            if !config_path.exists() && action == ServiceAction::Install {
                bail!(
                    "Config file {} does not exist, refusing to install the service",
                    config_path.display()
                );
            }
            let manager = detect_service_manager()?;
            let definition = ServiceDefinition {
                name: SERVICE_NAME.to_string(),
                display_name: "Sidecar".to_string(),
                description: "Log collector sidecar agent".to_string(),
                executable: std::env::current_exe()
                    .context("Failed to resolve the sidecar executable")?,
                args: vec![
                    "--config".to_string(),
                    config_path.display().to_string(),
                    "run".to_string(),
                ],
                restart_on_failure: true,
            };
            let message = control(manager.as_ref(), &definition, action).await?;
            println!("{}", message);
        }
    }

    Ok(())
}
