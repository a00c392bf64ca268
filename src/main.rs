use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasewire::{
    ClientConfig, ClientService, DhcpClient, DhcpServer, MacAddr, OptionCodec, Result,
    ServerConfig, ServerService,
};

#[derive(Parser)]
#[command(name = "leasewire")]
#[command(author, version, about = "A DHCPv4 server and client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve leases on port 67
    Run,
    /// Print the effective server configuration
    ShowConfig,
    /// List the option table with config keys and defaults
    ListOptions,
    /// Acquire and hold a lease on port 68
    Client {
        #[arg(long)]
        mac: MacAddr,

        #[arg(long)]
        hostname: Option<String>,

        /// Send RELEASE on Ctrl-C
        #[arg(long)]
        release: bool,
    },
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", error);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = ServerConfig::load_or_create(&cli.config)?;
            info!("Starting DHCP server with config: {:?}", cli.config);

            let server = DhcpServer::new(config, OptionCodec::standard())?;
            let service = ServerService::bind(server)?;
            let server = service.run(shutdown_signal()).await?;

            info!(
                "Stopped with {} lease(s) held",
                server.pool().snapshot().len()
            );
            Ok(())
        }
        Commands::ShowConfig => {
            let config = ServerConfig::load_or_create(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListOptions => {
            let config = ServerConfig::load_or_create(&cli.config)?;
            let codec = OptionCodec::standard();
            let values = config.option_values(codec.registry())?;

            println!(
                "{:<6} {:<26} {:<8} {:<20} {}",
                "Code", "Name", "Type", "Config Key", "Value"
            );
            println!("{}", "-".repeat(80));

            for spec in codec.registry().iter() {
                let value = spec
                    .resolve(&values)
                    .map(|value| codec.registry().describe(spec.code, &value))
                    .unwrap_or_default();

                println!(
                    "{:<6} {:<26} {:<8} {:<20} {}",
                    spec.code,
                    spec.name,
                    spec.value_type.to_string(),
                    spec.config_key.as_deref().unwrap_or("-"),
                    value
                );
            }
            Ok(())
        }
        Commands::Client {
            mac,
            hostname,
            release,
        } => {
            let config = ClientConfig {
                mac,
                hostname,
                release_on_close: release,
                ..Default::default()
            };
            info!("Starting DHCP client for {}", mac);

            let client = DhcpClient::new(config, OptionCodec::standard())?;
            let service = ClientService::bind(client)?;
            let client = service.run(shutdown_signal()).await?;

            info!("Client stopped in {:?}", client.state());
            Ok(())
        }
    }
}
