use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod assembler;
mod config;
mod demux;
mod engine;
mod errors;
mod handlers;
mod preview;
mod process;
mod scheduler;
mod session;
mod utils;

#[cfg(test)]
mod test_support;

use config::{Config, PreviewConfig};
use engine::{FfmpegEngine, MediaEngine};
use process::ProcessRegistry;
use session::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "timelapse-server", version, about = "RTSP time-lapse capture server")]
struct Args {
    /// Path to the TOML (or .json) configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the HTTP port from the configuration
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub engine: Arc<dyn MediaEngine>,
    pub preview: Arc<PreviewConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(sessions: SessionManager, engine: Arc<dyn MediaEngine>, preview: PreviewConfig) -> Self {
        Self {
            sessions,
            engine,
            preview: Arc::new(preview),
            start_time: Instant::now(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("timelapse_server=debug,info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(port) = args.port {
        config.server.port = port;
    }

    std::fs::create_dir_all(&config.storage.frames_directory)?;
    std::fs::create_dir_all(&config.storage.output_directory)?;
    info!(
        "Frames directory: {}, output directory: {}",
        config.storage.frames_directory.display(),
        config.storage.output_directory.display()
    );

    let registry = ProcessRegistry::new();
    let engine: Arc<dyn MediaEngine> = Arc::new(FfmpegEngine::new(config.engine.clone(), registry.clone()));
    if !engine.available().await {
        warn!("{} not found; capture requests will fail until it is installed", config.engine.binary);
    }

    let sessions = SessionManager::new(
        engine.clone(),
        registry,
        config.storage.frames_directory.clone(),
        config.storage.output_directory.clone(),
        Duration::from_secs(config.engine.probe_timeout_secs),
    )
    .with_stop_grace(Duration::from_secs(config.engine.grab_timeout_secs.saturating_add(5)));
    let state = AppState::new(sessions.clone(), engine, config.preview.clone());

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => {
                    tower_http::cors::CorsLayer::new()
                        .allow_origin(origin_header)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = handlers::router(state).layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting timelapse server on {}", addr);
    start_http_server(app, &addr, sessions).await?;

    info!("Server stopped");
    Ok(())
}

async fn start_http_server(app: axum::Router, addr: &str, sessions: SessionManager) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;
    Ok(())
}

// Live previews never end on their own, so engines are killed before axum
// waits for open connections to drain.
async fn shutdown_signal(sessions: SessionManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    sessions.shutdown().await;
}
