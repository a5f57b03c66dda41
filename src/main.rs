//! gank - expose local services through a public relay
//!
//! `gank server` runs the relay, `gank client` connects local services to it.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gank_client::{ClientConfig, TunnelClient};
use gank_control::{ServerConfig, TunnelServer};
use gank_server_https::{HttpServer, TlsMaterial};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// gank - reverse tunnels for tcp, udp and web services
#[derive(Parser, Debug)]
#[command(name = "gank")]
#[command(about = "Expose local services through a public relay")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Server {
        /// Server config file (JSON)
        #[arg(short, long, env = "GANK_SERVER_CONFIG")]
        config: PathBuf,
    },

    /// Connect local services to a relay
    #[command(long_about = r#"
Connect local services to a relay. Either load every tunnel from a config
file, or expose a single local web service with flags.

EXAMPLES:
  gank client --config client.json
  gank client --server gank007.com:4443 --port 3000 --subdomain blog --token $GANK_TOKEN
    "#)]
    Client {
        /// Client config file (JSON)
        #[arg(short, long, env = "GANK_CLIENT_CONFIG", conflicts_with_all = ["server", "port", "subdomain"])]
        config: Option<PathBuf>,

        /// Relay control address (host:port)
        #[arg(long, env = "GANK_SERVER", requires_all = ["port", "subdomain"])]
        server: Option<String>,

        /// Local web service port
        #[arg(long)]
        port: Option<u16>,

        /// Subdomain to claim on the relay
        #[arg(long)]
        subdomain: Option<String>,

        /// Authentication token
        #[arg(long, env = "GANK_TOKEN")]
        token: Option<String>,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = TunnelServer::new(config.clone());
    let state = server.state();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let control = server.bind().await?;
    tasks.spawn(async move { server.run(control).await.context("Control server failed") });

    if let Some(port) = config.http_port {
        let listener = HttpServer::bind(SocketAddr::new(config.bind_ip, port)).await?;
        let http = HttpServer::plain(state.clone());
        tasks.spawn(async move { http.run(listener).await.context("HTTP server failed") });
    }

    if let Some(tls) = &config.tls {
        let material = TlsMaterial::from_files(&tls.cert, &tls.key, tls.ca.as_deref())?;
        let acceptor = material.acceptor()?;
        let listener = HttpServer::bind(SocketAddr::new(config.bind_ip, config.https_port)).await?;
        let https = HttpServer::tls(state.clone(), acceptor);
        tasks.spawn(async move { https.run(listener).await.context("HTTPS server failed") });
    }

    info!("gank server ready for *.{}", config.domain);
    while let Some(result) = tasks.join_next().await {
        result.context("Server task panicked")??;
    }
    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    info!(
        "Connecting {} tunnel(s) to {}",
        config.tunnels.len(),
        config.server_addr
    );
    let client = TunnelClient::new(config).start()?;
    client.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let task = match cli.command {
        Commands::Server { config } => {
            let config = config::load_server_config(&config)?;
            tokio::spawn(run_server(config))
        }
        Commands::Client {
            config,
            server,
            port,
            subdomain,
            token,
        } => {
            let config = match (config, server, port, subdomain) {
                (Some(path), _, _, _) => {
                    let mut config = config::load_client_config(&path)?;
                    if let Some(token) = token {
                        config.token = token;
                    }
                    config
                }
                (None, Some(server), Some(port), Some(subdomain)) => {
                    let config = ClientConfig::web(server, port, subdomain, token);
                    config.validate()?;
                    config
                }
                _ => anyhow::bail!("either --config or --server, --port and --subdomain is required"),
            };
            tokio::spawn(run_client(config))
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = task => {
            match result {
                Ok(Ok(())) => info!("Stopped"),
                Ok(Err(e)) => {
                    error!("{:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
