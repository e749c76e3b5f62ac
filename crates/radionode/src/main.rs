use anyhow::Result;
use clap::{Parser, Subcommand};
use meshradio_network::RendezvousHub;
use radionode::config::{Config, LoggingConfig};
use radionode::node::RadioNode;
use radionode::{logging, rendezvous_server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "radionode")]
#[command(about = "MeshRadio mesh node", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "RADIONODE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, env = "RADIONODE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Initialize a new configuration and exit
    #[arg(long)]
    init: bool,

    /// Log level, overrides the configuration file
    #[arg(long, env = "RADIONODE_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mesh node (default)
    Run {
        /// Rendezvous server URL, overrides the configuration file
        #[arg(long)]
        rendezvous: Option<String>,

        /// Port of the HTTP API, overrides the configuration file
        #[arg(long)]
        api_port: Option<u16>,

        /// Do not read commands from stdin
        #[arg(long)]
        no_console: bool,
    },

    /// Run a WebSocket rendezvous server
    Rendezvous {
        #[arg(long, default_value = "0.0.0.0:8765")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init {
        let config = Config::create_default(cli.config, cli.data_dir)?;
        println!("Configuration written to {}", config.config_path().display());
        println!("Data directory: {}", config.data_directory.display());
        return Ok(());
    }

    match cli.command {
        Some(Command::Rendezvous { bind }) => {
            let logging_config = LoggingConfig {
                level: cli.log_level.unwrap_or_else(|| "info".to_string()),
                ..LoggingConfig::default()
            };
            logging::init(&logging_config)?;

            let listener = TcpListener::bind(&bind).await?;
            let hub = Arc::new(RendezvousHub::new());
            tokio::select! {
                result = rendezvous_server::serve(listener, hub) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C signal");
                    Ok(())
                }
            }
        }
        command => {
            let mut config = Config::load(cli.config, cli.data_dir)?;
            let mut console = true;
            if let Some(Command::Run {
                rendezvous,
                api_port,
                no_console,
            }) = command
            {
                if rendezvous.is_some() {
                    config.rendezvous.url = rendezvous;
                }
                if let Some(port) = api_port {
                    config.api.port = port;
                }
                console = !no_console;
            }
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }

            logging::init(&config.logging)?;
            info!("Loaded configuration from {}", config.config_path().display());

            let mut node = RadioNode::new(config).await?;
            node.run(console).await
        }
    }
}
