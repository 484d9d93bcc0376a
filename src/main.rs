//! juliet - IRC server with a radio uplink
//!
//! Serves chat clients over TCP and relays channel traffic over a serial
//! radio as checksummed text frames. `juliet client` instead joins channels
//! on an existing chat server as a relay bot.

use clap::{Parser, Subcommand};
use juliet_protocol::{Message, Reassembler};
use juliet_radio::{LoopbackDevice, RadioTransport, SerialDevice, TransportConfig};
use juliet_server::{
    ClientChannel, Config, RadioBridge, RadioConfig, RelayClient, Server, ServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "juliet")]
#[command(about = "IRC server bridging chat channels onto a radio link", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "JULIET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides configuration)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Run without the radio bridge
    #[arg(long)]
    no_radio: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve chat clients (default)
    Serve,
    /// Join channels on another chat server as a relay bot
    Client {
        /// Chat server host
        #[arg(long)]
        host: Option<String>,

        /// Chat server port
        #[arg(long)]
        port: Option<u16>,

        /// Bot nickname
        #[arg(long)]
        nick: Option<String>,

        /// Channel to join; repeat for several (replaces configured channels)
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
}

fn open_radio(radio: &RadioConfig) -> Result<RadioTransport, Box<dyn std::error::Error>> {
    let transport_config = TransportConfig {
        transmit_interval: radio.transmit_interval(),
        ..Default::default()
    };

    let transport = if radio.loopback {
        tracing::info!("  Radio: loopback");
        RadioTransport::open(
            LoopbackDevice::echo().with_read_timeout(radio.read_timeout()),
            transport_config,
        )?
    } else {
        let port = radio.port.as_deref().ok_or("radio port not configured")?;
        tracing::info!("  Radio: {} at {} baud", port, radio.baud_rate);
        let device = SerialDevice::open(port, radio.baud_rate, radio.read_timeout())?;
        RadioTransport::open(device, transport_config)?
    };

    Ok(transport)
}

/// Opens the radio and feeds received bytes through a reassembler.
fn start_radio(
    radio: &RadioConfig,
) -> Result<(Arc<RadioTransport>, Arc<Reassembler>), Box<dyn std::error::Error>> {
    let transport = Arc::new(open_radio(radio)?);
    let reassembler = Arc::new(
        Reassembler::new()
            .with_max_len(radio.max_buffer_bytes)
            .with_checksum_verification(radio.verify_checksum),
    );
    {
        let reassembler = reassembler.clone();
        transport.on_receive(move |data: &[u8]| {
            reassembler.append(data);
        });
    }
    transport.on_transmit(|data: &[u8]| {
        tracing::debug!("radio sent {}", String::from_utf8_lossy(data));
    });
    Ok((transport, reassembler))
}

/// Packs uplinked messages onto the radio until the channel closes.
fn spawn_uplink(
    transport: Arc<RadioTransport>,
    mut uplink_rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = uplink_rx.recv().await {
            let packed = match message.pack() {
                Ok(packed) => packed,
                Err(e) => {
                    tracing::warn!("Dropping radio message: {}", e);
                    continue;
                }
            };
            if let Err(e) = transport.send(packed) {
                tracing::warn!("Dropping radio message: {}", e);
            }
        }
    })
}

fn close_radio(transport: &RadioTransport) {
    if let Err(e) = transport.close() {
        tracing::error!("Failed to close radio: {}", e);
    }
    tracing::info!(
        "Radio closed ({} bytes sent, {} bytes received)",
        transport.stats().bytes_sent(),
        transport.stats().bytes_received()
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Explicit config files must load; otherwise defaults plus environment.
    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };

    if let Some(bind) = args.bind {
        config.network.bind_addr = bind;
    }
    if args.no_radio {
        config.radio.enabled = false;
    }

    match args.command {
        None | Some(Command::Serve) => {
            config.validate()?;
            run_server(config).await
        }
        Some(Command::Client {
            host,
            port,
            nick,
            channels,
        }) => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            if let Some(nick) = nick {
                config.client.nickname = nick;
            }
            if !channels.is_empty() {
                config.client.channels = channels
                    .into_iter()
                    .map(|name| ClientChannel { name, key: None })
                    .collect();
            }
            config.validate()?;
            config.client.validate()?;
            run_client(config).await
        }
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting juliet {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Server name: {}", config.server.name);
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Password: {}",
        if config.server.password.is_some() {
            "required"
        } else {
            "none"
        }
    );

    let server_config = ServerConfig::from_config(&config);

    if !config.radio.enabled {
        tracing::info!("  Radio: disabled");
        let server = Arc::new(Server::new(server_config));
        spawn_shutdown_handler(server.clone());
        server.run().await?;
        return Ok(());
    }

    let (uplink_tx, uplink_rx) = mpsc::unbounded_channel::<Message>();
    let server = Arc::new(Server::with_uplink(server_config, uplink_tx));
    let (transport, reassembler) = start_radio(&config.radio)?;

    // Radio -> reassembler -> channels
    let bridge = RadioBridge::new(
        server.registry().clone(),
        config.server.name.clone(),
        config.radio.relay_channel.clone(),
    )
    .with_station(config.radio.callsign.as_deref());
    tracing::info!("  Relay channel: {}", bridge.relay_channel());

    reassembler.subscribe(move |message: &Message| {
        tracing::debug!(
            "radio {} message from {}",
            message.kind().name(),
            message.sender().unwrap_or("unknown")
        );
        bridge.deliver(message);
    });

    // Channels -> radio
    let uplink = spawn_uplink(transport.clone(), uplink_rx);

    spawn_shutdown_handler(server.clone());
    let result = server.run().await;

    uplink.abort();
    close_radio(&transport);

    result?;
    Ok(())
}

async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting juliet {} in client mode", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "  Server: {}:{} as {}",
        config.client.host,
        config.client.port,
        config.client.nickname
    );

    if !config.radio.enabled {
        return Err("client mode needs the radio enabled".into());
    }

    let (transport, reassembler) = start_radio(&config.radio)?;

    // Radio -> reassembler -> bot
    let (downlink_tx, downlink_rx) = mpsc::unbounded_channel::<Message>();
    reassembler.subscribe(move |message: &Message| {
        if downlink_tx.send(message.clone()).is_err() {
            tracing::debug!("client gone, dropping radio message");
        }
    });

    // Bot -> radio
    let (uplink_tx, uplink_rx) = mpsc::unbounded_channel::<Message>();
    let uplink = spawn_uplink(transport.clone(), uplink_rx);

    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, leaving server...");
        let _ = stop_tx.send(());
    });

    let client = RelayClient::new(config.client.clone(), config.radio.relay_channel.clone())
        .with_callsign(config.radio.callsign.as_deref());
    let result = client.run(uplink_tx, downlink_rx, stop_rx).await;

    uplink.abort();
    close_radio(&transport);

    result?;
    Ok(())
}

fn spawn_shutdown_handler(server: Arc<Server>) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        server.shutdown();
    });
}
