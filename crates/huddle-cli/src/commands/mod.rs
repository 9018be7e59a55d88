use clap::{Parser, Subcommand};
use std::path::PathBuf;

use huddle_config::{ConfigLoader, HuddleConfig};
use huddle_core::HuddleError;

mod coordinator;
mod participant;

/// Huddle: rendezvous coordinator and direct peer mesh
#[derive(Parser)]
#[command(name = "huddle", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to huddle.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Coordinator {
        /// Address to listen on (overrides coordinator.listen)
        #[arg(long)]
        listen: Option<String>,
        /// Port to listen on (overrides coordinator.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join the mesh as a participant and read commands from stdin
    Participant {
        /// Participant name (overrides participant.name)
        #[arg(short, long)]
        name: Option<String>,
        /// Segment label (overrides participant.segment)
        #[arg(short, long)]
        segment: Option<String>,
    },
    /// Print the digest of a secret for the coordinator's credential table
    HashCredential {
        secret: String,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> huddle_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        init_tracing(&config, self.verbose, self.quiet, self.log_level.as_deref());

        match self.command {
            Commands::Coordinator { listen, port } => {
                coordinator::cmd_coordinator(config, listen, port).await
            }
            Commands::Participant { name, segment } => {
                participant::cmd_participant(config, name, segment).await
            }
            Commands::HashCredential { secret } => {
                println!("{}", huddle_mesh::credential::hash_credential(&secret));
                Ok(())
            }
            Commands::Config { json } => Self::cmd_config(&config, &config_loader, json),
            Commands::Version => Self::cmd_version(),
        }
    }

    fn cmd_config(config: &HuddleConfig, loader: &ConfigLoader, json: bool) -> huddle_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!("# {}", loader.path().display());
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| HuddleError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_version() -> huddle_core::Result<()> {
        println!("huddle {}", env!("CARGO_PKG_VERSION"));
        println!("   Default coordinator port: {}", huddle_config::CoordinatorConfig::default().port);
        println!("   Reserved name:            {}", huddle_core::COORDINATOR_NAME);
        Ok(())
    }
}

/// Resolve the log level (--verbose > --quiet > --log-level > config) and
/// install the subscriber. `RUST_LOG` overrides all of them.
fn init_tracing(config: &HuddleConfig, verbose: bool, quiet: bool, log_level: Option<&str>) {
    let log_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        log_level.unwrap_or(&config.logging.level)
    };
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level))
    };

    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}
