use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lanshare::config::get_config_path;
use lanshare::mesh::{
    short_id, PeerCoordinator, RtcLinkFactory, SignalingTransport, WsRelayConnector,
};
use lanshare::Config;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(about = "Share URLs with your other devices over peer-to-peer links", long_about = None)]
struct Cli {
    /// Signaling relay URL (overrides config)
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this device's id
    Id,
    /// Print the config file path and contents
    Config,
    /// Join a network and print URLs shared by peers until Ctrl-C
    Join {
        /// Network id (defaults to the configured one)
        #[arg(long)]
        network: Option<String>,
    },
    /// Share a URL with every connected peer
    Send {
        /// URL to share
        url: String,
        /// Network id (defaults to the configured one)
        #[arg(long)]
        network: Option<String>,
        /// Seconds to wait for a peer before giving up
        #[arg(long, default_value_t = 15)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanshare=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(relay) = cli.relay {
        config.mesh.relay_url = relay;
    }

    match cli.command {
        Commands::Id => {
            println!("{}", config.device.id);
        }
        Commands::Config => {
            println!("# {}", get_config_path().display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to encode config")?
            );
        }
        Commands::Join { network } => {
            let mesh = start(&config)?;
            let network = network.unwrap_or_else(|| config.mesh.network_id.clone());

            let _status = mesh.on_status_change(|status| info!("Relay {}", status));
            let _peers = mesh.on_peers_change(|snapshot| {
                if snapshot.is_empty() {
                    info!("No peers");
                }
                for peer in snapshot.iter() {
                    info!("Peer {} {}", short_id(&peer.peer_id), peer.connection_state);
                }
            });
            let _urls = mesh.on_incoming_url(|incoming| {
                println!("{}", incoming.url);
            });

            mesh.connect(&network)
                .await
                .context("Failed to join network")?;
            println!("Joined {} as {}", network, mesh.local_id());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            mesh.disconnect().await?;
        }
        Commands::Send {
            url,
            network,
            wait_secs,
        } => {
            let mesh = start(&config)?;
            let network = network.unwrap_or_else(|| config.mesh.network_id.clone());
            mesh.connect(&network)
                .await
                .context("Failed to join network")?;

            let deadline = Instant::now() + Duration::from_secs(wait_secs);
            while mesh.open_peers().await? == 0 {
                if Instant::now() >= deadline {
                    warn!("No peer connected within {}s", wait_secs);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let delivered = mesh.broadcast(&url).await?;
            // Let the channels drain before closing them
            tokio::time::sleep(Duration::from_millis(500)).await;
            mesh.disconnect().await?;
            println!("Delivered to {} peers", delivered);
        }
    }

    Ok(())
}

fn start(config: &Config) -> Result<PeerCoordinator> {
    if !config.mesh.enabled {
        bail!("LAN sharing is disabled in {}", get_config_path().display());
    }
    let mesh_config = config.mesh_config();
    let transport = SignalingTransport::new(
        config.device.id.clone(),
        mesh_config.relay_url.clone(),
        Arc::new(WsRelayConnector::new()),
    );
    let links = Arc::new(RtcLinkFactory::new(mesh_config.stun_servers.clone()));
    Ok(PeerCoordinator::spawn(transport, links, mesh_config))
}
