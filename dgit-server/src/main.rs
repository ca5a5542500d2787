//! DGit Server - Git Smart HTTP Server
//!
//! Serves fetch and push for many repositories from memory or from bare
//! repositories on disk.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dgit_http::{Config, GitHttpHandler, StorageBackend};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DGit Server Configuration
#[derive(Parser, Debug)]
#[command(name = "dgit")]
#[command(author = "DGit Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Git smart HTTP server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Directory holding the bare repositories
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Storage backend (memory or filesystem)
        #[arg(short, long)]
        storage: Option<StorageBackend>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Initialize a new bare repository
    Init {
        /// Repository path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            data_dir,
            storage,
            config,
            debug,
        } => {
            // Initialize tracing
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let mut config = match config {
                Some(path) => Config::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(storage) = storage {
                config.storage = storage;
            }

            info!("Starting DGit server on {}", addr);
            info!("Storage backend: {}", config.storage);
            if config.storage == StorageBackend::Filesystem {
                std::fs::create_dir_all(&config.data_dir).with_context(|| {
                    format!("creating data directory {}", config.data_dir.display())
                })?;
                info!("Repository root: {}", config.data_dir.display());
            } else {
                info!("Repositories are created on first use and kept in memory");
            }

            let handler = Arc::new(GitHttpHandler::with_config(config));

            // Start server
            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;

            info!("Server listening on {}", addr);
            info!("Ready to accept git client connections");

            loop {
                let (stream, _) = listener.accept().await?;
                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(req, handler.clone())),
                        )
                        .await
                    {
                        error!("Error serving connection: {:?}", e);
                    }
                });
            }
        }

        Commands::Init { path } => {
            dgit_core::init_bare_repository(&path)
                .with_context(|| format!("initializing {}", path.display()))?;
            println!("Initialized empty bare repository in {}", path.display());
            println!("Serve it with:");
            println!(
                "  dgit start --storage filesystem --data-dir {}",
                path.parent()
                    .filter(|parent| !parent.as_os_str().is_empty())
                    .map(|parent| parent.display().to_string())
                    .unwrap_or_else(|| ".".to_string())
            );
        }
    }

    Ok(())
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<GitHttpHandler>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    info!("Request: {} {}", req.method(), req.uri());
    for (name, value) in req.headers().iter() {
        tracing::debug!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
    }

    let response = match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Request error: {}", e);
            e.into_response()
        }
    };

    info!(
        "Response: {} ({})",
        response.status(),
        dgit_http::content_type(&response)
    );

    Ok(response)
}
