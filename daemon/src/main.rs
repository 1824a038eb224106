mod server;

use clap::{Args, Parser, Subcommand};
use secstor_agent::{AgentConfig, SecondaryStorage};
use secstor_core::Command;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "secstor-daemon")]
#[command(about = "Secondary storage data-plane agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve newline-delimited JSON commands on a Unix socket
    Start {
        /// Socket to listen on
        #[arg(long, env = "SECSTOR_SOCKET", default_value = "/var/run/secstor.sock")]
        socket: PathBuf,

        #[command(flatten)]
        node: NodeArgs,
    },
    /// Run a single command read from a JSON file and print its answer
    Exec {
        /// File holding the command
        #[arg(long)]
        command: PathBuf,

        #[command(flatten)]
        node: NodeArgs,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// JSON configuration file
    #[arg(long, env = "SECSTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Private root for mount points
    #[arg(long, env = "SECSTOR_MOUNT_ROOT")]
    mount_root: Option<PathBuf>,

    /// Directory holding the conversion scripts
    #[arg(long, env = "SECSTOR_SCRIPTS_DIR")]
    scripts_dir: Option<PathBuf>,

    /// Whether this node is a storage VM that mounts its shares
    #[arg(long, env = "SECSTOR_IN_SYSTEM_VM")]
    in_system_vm: Option<bool>,

    /// Path of the swift command line client
    #[arg(long, env = "SECSTOR_SWIFT_CLI")]
    swift_cli: Option<PathBuf>,
}

impl NodeArgs {
    fn load(self) -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(root) = self.mount_root {
            config.mount_root = root;
        }
        if let Some(dir) = self.scripts_dir {
            config.scripts_dir = dir;
        }
        if let Some(in_system_vm) = self.in_system_vm {
            config.in_system_vm = in_system_vm;
        }
        if let Some(swift_cli) = self.swift_cli {
            config.swift_cli = swift_cli;
        }
        Ok(config)
    }
}

async fn init_storage(node: NodeArgs) -> Result<SecondaryStorage, Box<dyn std::error::Error>> {
    let config = node.load()?;
    if config.in_system_vm {
        tokio::fs::create_dir_all(&config.mount_root).await?;
    }
    Ok(SecondaryStorage::new(config)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { socket, node } => {
            let storage = Arc::new(init_storage(node).await?);
            tracing::info!("Starting secondary storage agent on {:?}", socket);
            server::serve(storage, &socket).await?;
        }
        Commands::Exec { command, node } => {
            let storage = init_storage(node).await?;
            let text = tokio::fs::read_to_string(&command).await?;
            let command: Command = serde_json::from_str(&text)?;
            let answer = storage.execute(command).await;
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
    }

    Ok(())
}
