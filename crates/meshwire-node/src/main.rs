//! meshwire - peer heartbeat, payment and directory sync over TCP

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshwire_core::{PeerId, TarPackager, TcpTransport};
use meshwire_node::config::{expand_path, Config, DEFAULT_CONFIG_PATH};
use meshwire_node::{Node, NodeEvent};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshwire")]
#[command(about = "Peer heartbeat, payment and directory sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Shared directory (overrides config)
    #[arg(long)]
    shared_dir: Option<String>,

    /// Staging directory for snapshot archives (overrides config)
    #[arg(long)]
    staging_dir: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve heartbeat, payment and sync until interrupted
    Serve,

    /// Check whether a peer is online
    Heartbeat {
        /// Peer address, e.g. /ip4/127.0.0.1/tcp/4001/p2p/<peer id>
        #[arg(required = true)]
        address: String,
    },

    /// Send a payment record to a peer
    Pay {
        /// Peer address
        #[arg(required = true)]
        address: String,

        /// Amount to send
        #[arg(required = true, allow_negative_numbers = true)]
        amount: f64,
    },

    /// Merge a peer's snapshot into the local shared directory
    Sync {
        /// Peer address
        #[arg(required = true)]
        address: String,
    },

    /// Initialize configuration
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => init_config(&cli.config)?,
        Commands::Serve => serve(start_node(&config, true).await?).await?,
        Commands::Heartbeat { address } => {
            let node = start_node(&config, false).await?;
            let reply = node.heartbeat(&address).await?;
            println!("{}", reply.message);
        }
        Commands::Pay { address, amount } => {
            let node = start_node(&config, false).await?;
            let receipt = node.pay(&address, amount).await?;
            if !receipt.record_delivered {
                tracing::warn!("Payment record was not delivered; ack received anyway");
            }
            println!("{} => {}: {}", receipt.sender, receipt.receiver, amount);
            println!("{}", receipt.ack);
        }
        Commands::Sync { address } => {
            let node = start_node(&config, false).await?;
            let report = node.request_sync(&address).await?;
            println!(
                "Received {} bytes from {} into {}",
                report.bytes,
                report.peer,
                report.destination.display()
            );
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(&expand_path(&cli.config))?;
    if let Some(dir) = &cli.shared_dir {
        config.sync.shared_dir = dir.clone();
    }
    if let Some(dir) = &cli.staging_dir {
        config.sync.staging_dir = dir.clone();
    }
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    Ok(config)
}

/// Client commands listen on an ephemeral port so they can run beside `serve`
async fn start_node(config: &Config, serving: bool) -> Result<Node<TcpTransport>> {
    config.check_dirs()?;
    let shared_dir = config.shared_dir();
    let staging_dir = config.staging_dir();

    let mut listen_addr = config.listen_addr()?;
    if !serving {
        listen_addr.set_port(0);
    }
    let transport = TcpTransport::bind(PeerId::random()?, listen_addr).await?;
    let packager = Arc::new(TarPackager::new(staging_dir));
    Ok(Node::new(transport, packager, shared_dir))
}

async fn serve(node: Node<TcpTransport>) -> Result<()> {
    std::fs::create_dir_all(node.shared_dir())?;
    node.mount_all();

    println!("Peer ID: {}", node.peer_id());
    println!("Listening on: {}", node.address());
    println!("Sharing: {}", node.shared_dir().display());
    println!("Press Ctrl+C to stop");

    let mut events = node.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(NodeEvent::PaymentReceived { from, record }) => {
                    println!("{} paid {} ({} -> {})", from, record.amount, record.sender, record.receiver);
                }
                Ok(NodeEvent::SyncServed { to, bytes }) => {
                    println!("Served {} bytes to {}", bytes, to);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Missed {} node events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("\nShutting down...");
    Ok(())
}

fn init_config(path: &str) -> Result<()> {
    let config_path = expand_path(path);
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created config directory: {}", parent.display());
        }
    }

    let config = Config::default();
    config.save(&config_path)?;
    std::fs::create_dir_all(config.staging_dir())?;

    println!("Initialized meshwire at: {}", config_path.display());

    Ok(())
}
