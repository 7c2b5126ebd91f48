//! Ethernet Transfer - sentinel-framed object transfer over TCP
//!
//! Runs an echo server, or a client that sends keyed text items to one.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ethernet_transfer::config::{self, Config};
use ethernet_transfer::network::{EthernetClient, EthernetServer, NoHooks, TransferHooks};
use ethernet_transfer::protocol;
use ethernet_transfer::transfer::{MemoryDepot, Parcel, Transfer, TransferMessage};

/// Ethernet Transfer - object rounds over TCP
#[derive(Parser)]
#[command(name = "ethernet-transfer")]
#[command(author = "Ethernet Transfer Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange keyed items over sentinel-framed TCP rounds", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server answering every round with the items it received
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Send items to a server and print its response
    Client {
        /// Server address, host or host:port
        #[arg(short, long)]
        server: Option<String>,

        /// Item to send, as key=text (repeatable)
        #[arg(short, long = "item", value_parser = parse_item)]
        items: Vec<Parcel>,

        /// Ask the server for strict request/response alternation
        #[arg(long)]
        synchronic: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn parse_item(raw: &str) -> Result<Parcel, String> {
    match raw.split_once('=') {
        Some((key, text)) if !key.is_empty() => Ok(Parcel::new(key, text.as_bytes().to_vec())),
        _ => Err(format!("expected key=text, got '{}'", raw)),
    }
}

/// Echoes each request's items back in the response
struct EchoHooks;

impl TransferHooks<Parcel> for EchoHooks {
    fn header_received(&self, transfer: &mut Transfer<Parcel>) {
        let items = transfer.request_header.items_count;
        if items > 0 {
            // The response needs the request body, so wait for it
            transfer.context.synchronic = true;
        } else if !transfer.context.denied {
            transfer.response_header.append_notice("No items to echo");
        }
    }

    fn message_received(&self, transfer: &mut Transfer<Parcel>) {
        let items = transfer.request_message.data.clone();
        transfer
            .response_header
            .append_notice(format!("Echoed {} items", items.len()));
        transfer.response_message = TransferMessage::new(items);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, host } => {
            run_server(config, host, port).await?;
        }
        Commands::Client {
            server,
            items,
            synchronic,
        } => {
            run_client(config, server, items, synchronic).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
            println!("Default Port: {}", protocol::DEFAULT_PORT);
            println!("Markup run length: {}", protocol::DEFAULT_RUN_LENGTH);
        }
    }

    Ok(())
}

/// Run the echo server until Ctrl+C
async fn run_server(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut net_config = config.server_config();
    if let Some(host) = host {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.port = port;
    }

    let identity = net_config.identity.clone();
    let mut server = EthernetServer::new(net_config, Arc::new(MemoryDepot::new()), Arc::new(EchoHooks))
        .with_echo(Arc::new(|line: &str| println!("{}", line)));

    let addr = server.start().await?;

    println!("\n========================================");
    println!("  Ethernet Transfer Server Running");
    println!("========================================");
    println!("  Name: {}", identity.name);
    println!("  Id: {}", identity.id);
    println!("  Listening: {}", addr);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.stop().await?;
    Ok(())
}

/// Send one round of items and print what came back
async fn run_client(
    config: Config,
    server: Option<String>,
    items: Vec<Parcel>,
    synchronic: bool,
) -> anyhow::Result<()> {
    let mut net_config = config.client_config();
    if let Some(server) = server {
        match server.rsplit_once(':') {
            Some((host, port)) => {
                net_config.host = host.to_string();
                net_config.port = port.parse()?;
            }
            None => net_config.host = server,
        }
    }
    if synchronic {
        net_config.transfer.synchronic = true;
    }

    let depot = Arc::new(MemoryDepot::new());
    let client = EthernetClient::new(net_config, depot.clone(), Arc::new(NoHooks));

    let connection = client.connect().await?;
    let sent = items.len();
    connection
        .with_transfer(|transfer| transfer.request_message = TransferMessage::new(items))
        .await;

    client.round().await?;

    let transfer = connection.transfer().await;
    let header = &transfer.response_header;
    println!("Sent {} items to {}", sent, header.identity.name);
    if header.denied {
        println!("Denied by server");
    }
    if let Some(notice) = &header.notice {
        println!("Notice: {}", notice);
    }
    for parcel in depot.parcels(&header.identity.id) {
        println!("  {} = {}", parcel.key, String::from_utf8_lossy(&parcel.body));
    }
    drop(transfer);

    client.close().await;
    Ok(())
}
