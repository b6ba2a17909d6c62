//! TETHER CLI
//!
//! Secure connection upgrades for peer-to-peer transports

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::{Dialer, Listener, Protector, PskProtector, SecureConnection, Upgrader};
use tether_crypto::pnet::NetworkSecret;
use tether_crypto::{Keypair, PeerId};
use tether_transport::{Address, TcpTransport};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;

/// TETHER - authenticated, encrypted peer connections
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Keygen {
        /// Output file for the private key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a private network swarm key
    Genpsk {
        /// Output file for the swarm key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Accept secure connections and echo everything back
    Listen {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Dial a peer, send a message and print the echo
    Dial {
        /// Remote address, e.g. tcp://127.0.0.1:4001
        #[arg(required = true)]
        address: String,

        /// Expected remote peer id (hex)
        #[arg(required = true)]
        peer: String,

        /// Message to send
        #[arg(short, long, default_value = "hello")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Keygen { output } => generate_keypair(output, &config)?,
        Commands::Genpsk { output } => generate_swarm_key(output)?,
        Commands::Listen { bind } => run_echo_listener(bind, &config).await?,
        Commands::Dial {
            address,
            peer,
            message,
        } => dial_peer(&address, &peer, &message, &config).await?,
    }

    Ok(())
}

/// Generate a new identity keypair
fn generate_keypair(output: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let keypair = Keypair::generate(&mut rand_core::OsRng);
    let path = output.unwrap_or_else(|| config.identity.key_file.clone());

    if path.exists() {
        anyhow::bail!("Refusing to overwrite existing key file {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = Zeroizing::new(hex::encode(*keypair.to_bytes()));
    std::fs::write(&path, encoded.as_bytes())?;

    println!("Peer ID: {}", keypair.peer_id());
    println!("Private key saved to: {}", path.display());
    Ok(())
}

/// Generate a swarm key for a private network
fn generate_swarm_key(output: Option<PathBuf>) -> anyhow::Result<()> {
    let secret = NetworkSecret::generate()?;
    let encoded = Zeroizing::new(secret.encode());

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, encoded.as_bytes())?;
            println!("Fingerprint: {}", secret.fingerprint());
            println!("Swarm key saved to: {}", path.display());
        }
        None => print!("{}", encoded.as_str()),
    }
    Ok(())
}

fn load_identity(path: &Path) -> anyhow::Result<Keypair> {
    if !path.exists() {
        tracing::warn!(
            "No identity at {}, using an ephemeral key (run `tether keygen`)",
            path.display()
        );
        return Ok(Keypair::generate(&mut rand_core::OsRng));
    }
    let contents = Zeroizing::new(std::fs::read_to_string(path)?);
    Keypair::from_hex(&contents)
        .with_context(|| format!("invalid identity file {}", path.display()))
}

fn load_protector(config: &Config) -> anyhow::Result<Option<Arc<PskProtector>>> {
    let Some(path) = &config.network.swarm_key_file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read swarm key {}", path.display()))?;
    let protector = PskProtector::from_swarm_key(&contents)?;
    tracing::info!("Private network enabled ({})", protector.fingerprint().short());
    Ok(Some(Arc::new(protector)))
}

fn upgrader(config: &Config) -> anyhow::Result<Upgrader> {
    let keypair = Arc::new(load_identity(&config.identity.key_file)?);
    let mut upgrader = Upgrader::new(keypair, config.upgrade_config());
    if let Some(protector) = load_protector(config)? {
        upgrader = upgrader.with_protector(protector);
    }
    Ok(upgrader)
}

/// Accept secure connections until Ctrl+C, echoing each one
async fn run_echo_listener(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let addr: Address = match bind {
        Some(bind) => bind.parse()?,
        None => config.parse_listen_addr()?,
    };
    let listener = Arc::new(Listener::bind(&TcpTransport::new(), &addr, upgrader(config)?).await?);

    println!("Peer ID: {}", listener.local_peer());
    println!("Listening on: {}", listener.local_addr());
    println!("Press Ctrl+C to stop");

    let mut accepting = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        tokio::spawn(echo(conn));
                    }
                    Err(e) => return e,
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            listener.close().await?;
            let _ = (&mut accepting).await;
        }
        ended = &mut accepting => {
            let e = ended.context("accept task failed")?;
            anyhow::bail!("listener stopped: {}", e);
        }
    }
    Ok(())
}

async fn echo(conn: SecureConnection) {
    let peer = conn.remote_peer();
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0usize;
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.write(&buf[..n]).await {
                    tracing::debug!("Echo to {} failed: {}", peer.short(), e);
                    break;
                }
                total += n;
            }
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", peer.short(), e);
                break;
            }
        }
    }
    let _ = conn.close().await;
    tracing::info!("Echoed {} bytes to {}", total, peer.short());
}

/// Dial a peer and print the echoed message
async fn dial_peer(address: &str, peer: &str, message: &str, config: &Config) -> anyhow::Result<()> {
    let addr: Address = address.parse()?;
    let peer: PeerId = peer.parse().context("invalid peer id")?;

    let keypair = Arc::new(load_identity(&config.identity.key_file)?);
    let mut dialer = Dialer::new(keypair, config.upgrade_config());
    if let Some(protector) = load_protector(config)? {
        dialer = dialer.with_protector(protector);
    }

    let conn = dialer.dial(&addr, &peer).await?;
    println!("Connected to {} via {}", conn.remote_peer(), conn.protocol());

    conn.write(message.as_bytes()).await?;
    conn.close_write().await?;

    let mut reply = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    let _ = conn.close().await;

    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
