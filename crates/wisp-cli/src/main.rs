//! WISP relay
//!
//! Wire-multiplexed Indirect Session Proxy: lets thin endpoints drive a DHT
//! node over one framed TCP or TLS connection.

mod config;

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wisp_discovery::{RelayServer, Swarm};
use wisp_transport::{Acceptor, TcpAcceptor, TlsAcceptor, TransportConfig};

use config::Config;

/// WISP relay - drive a DHT node on behalf of unreachable endpoints
#[derive(Parser, Debug)]
#[command(name = "wisp-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags win over the file
    fn apply(&self, config: &mut Config) {
        if let Some(host) = self.host {
            config.relay.host = host.to_string();
        }
        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            config.relay.cert = Some(cert.clone());
            config.relay.key = Some(key.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    cli.apply(&mut config);
    config.validate()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let tcp = TcpAcceptor::bind(addr, &TransportConfig::default())?;
    let acceptor: Arc<dyn Acceptor> = match config.tls_files() {
        Some((cert, key)) => Arc::new(
            TlsAcceptor::from_files(tcp, cert, key)?
                .with_handshake_timeout(Duration::from_secs(config.relay.tls_handshake_timeout_secs)),
        ),
        None => Arc::new(tcp),
    };

    let swarm = Swarm::new();
    let relay = Arc::new(RelayServer::new(Arc::new(swarm.node()), config.server_config()));
    let limit = Arc::new(Semaphore::new(config.relay.max_connections));

    info!(
        address = %acceptor.local_addr()?,
        scheme = acceptor.scheme(),
        version = env!("CARGO_PKG_VERSION"),
        "relay listening"
    );

    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
                        warn!(%peer, max = config.relay.max_connections, "connection limit reached");
                        continue;
                    };
                    let acceptor = Arc::clone(&acceptor);
                    let relay = Arc::clone(&relay);
                    tokio::spawn(async move {
                        let _permit = permit;
                        match acceptor.upgrade(stream).await {
                            Ok(io) => {
                                info!(%peer, "endpoint connected");
                                let reason = relay.serve(io).closed().await;
                                info!(%peer, ?reason, "endpoint disconnected");
                            }
                            Err(e) => warn!(%peer, error = %e, "transport upgrade failed"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
