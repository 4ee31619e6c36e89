#![forbid(unsafe_code)]
//! ForgeChain node binary

use clap::{Parser, Subcommand};
use colored::*;
use forgechain::config::load_config;
use forgechain::crypto::KeyPair;
use forgechain::node::Node;
use forgechain::persistence::{Database, Store};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a node
    Run {
        /// Path to the TOML configuration
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Start in catch-up mode and fetch missing blocks from peers
        #[arg(long)]
        catch_up: bool,
        /// Overrides network.p2p_port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Generates a new secret key and prints it with its address
    Keygen,
    /// Prints the handshake signature a peer presents for its address
    SignAddress {
        #[arg(long)]
        secret_key: String,
        /// Advertised address, e.g. ws://10.0.0.2:5001
        #[arg(long)]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            catch_up,
            port,
        } => run(&config, catch_up, port).await?,
        Commands::Keygen => {
            let keypair = KeyPair::generate();
            println!("{}", "🔑 New ForgeChain key".bright_cyan());
            println!("secret key: {}", keypair.secret_key_hex().bright_red());
            println!("address:    {}", keypair.address().bright_green());
        }
        Commands::SignAddress {
            secret_key,
            address,
        } => {
            let keypair = KeyPair::from_secret_hex(&secret_key)?;
            println!("{}", keypair.sign_hex(address.as_bytes())?);
        }
    }

    Ok(())
}

async fn run(config_path: &Path, catch_up: bool, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config_path)?;
    if catch_up {
        config.sync.catch_up = true;
    }
    if let Some(port) = port {
        config.network.p2p_port = port;
    }

    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data dir {:?}: {}", parent, e))?;
        }
    }
    let store: Arc<dyn Store> = Arc::new(Database::open(&config.database.path)?);

    println!(
        "{} {}",
        "⛓️  ForgeChain node listening on".bright_cyan(),
        config.network.advertised_address().bright_yellow()
    );

    let (node, channels) = Node::new(config, store)?;
    node.run(channels).await?;
    Ok(())
}
