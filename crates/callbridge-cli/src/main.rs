use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use callbridge_core::config::Config;
use callbridge_gateway::GatewayState;

mod logging;

#[derive(Parser)]
#[command(
    name = "callbridge",
    about = "Voice agent bridge for Twilio Media Streams",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the telephony gateway
    Serve {
        /// Port to listen on (default: 8080)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration, with secrets masked
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                println!("Config: {}", config_path.display());
                for warning in &warnings {
                    println!("  warning: {warning}");
                }
                for error in &errors {
                    println!("  error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("Refusing to start with {} configuration error(s)", errors.len());
    }

    let state = GatewayState::from_config(config)?;
    #[cfg(feature = "metrics")]
    let state = state.with_metrics(callbridge_gateway::metrics::install_prometheus_recorder()?);

    tracing::info!("Starting callbridge gateway on port {port}");
    callbridge_gateway::start_gateway(Arc::new(state), port).await
}

/// Copy of `config` with every inline API key masked.
fn redacted(config: &Config) -> Config {
    fn mask(key: &mut Option<String>) {
        if key.as_ref().is_some_and(|k| !k.is_empty()) {
            *key = Some("********".into());
        }
    }

    let mut config = config.clone();
    if let Some(stt) = config.stt.as_mut() {
        mask(&mut stt.api_key);
    }
    if let Some(llm) = config.llm.as_mut() {
        mask(&mut llm.api_key);
    }
    if let Some(tts) = config.tts.as_mut() {
        mask(&mut tts.api_key);
    }
    config
}
