//! idcard-photo daemon and operator CLI
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP API with defaults
//! idcard-photo serve
//!
//! # Start with custom config and port
//! idcard-photo --config /path/to/config.toml --http-port 8096 serve
//!
//! # One-off operations against the local record database
//! # (the daemon holds the database lock, so stop it first)
//! idcard-photo submit member-42 https://host/photo.jpg
//! idcard-photo upload member-42 ./photo.jpg
//! idcard-photo reclean member-42
//! idcard-photo reclean-degraded
//! idcard-photo show member-42
//! idcard-photo forget member-42
//!
//! # Counters of a running daemon
//! idcard-photo stats
//! ```

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use idcard_photo::{Config, HttpServer, PhotoService};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "idcard-photo")]
#[command(about = "ID-card photo cleaning service")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "IDCARD_PHOTO_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "IDCARD_PHOTO_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "IDCARD_PHOTO_HTTP_PORT")]
    http_port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "IDCARD_PHOTO_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Submit a raw photo URL for a member
    Submit { identity: String, raw_reference: String },
    /// Submit a photo file for a member
    Upload {
        identity: String,
        path: PathBuf,
        /// Content type of the file, if the extension is not enough
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Re-run the fallback chain for a member
    Reclean { identity: String },
    /// Re-run the fallback chain for every photo that was not fully cleaned
    RecleanDegraded,
    /// Print a member's photo record
    Show { identity: String },
    /// Remove a member's photo record
    Forget { identity: String },
    /// Print counters of the running daemon
    Stats,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("idcard_photo=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    config.pipeline.validate()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Stats => {
            let url = format!("http://127.0.0.1:{}/stats", config.http_port);
            let stats: serde_json::Value = reqwest::get(&url)
                .await
                .with_context(|| format!("is the daemon running? GET {}", url))?
                .error_for_status()?
                .json()
                .await?;
            print_json(&stats)
        }
        command => {
            let service = PhotoService::open(&config).await?;
            let result = run_command(&service, command).await;
            service.flush().await?;
            result
        }
    }
}

async fn run_command(service: &PhotoService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Submit {
            identity,
            raw_reference,
        } => print_json(&service.submit_raw_photo(&identity, &raw_reference).await?),
        Command::Upload {
            identity,
            path,
            content_type,
        } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let cleaned = service
                .submit_uploaded_photo(&identity, Bytes::from(data), content_type)
                .await?;
            print_json(&cleaned)
        }
        Command::Reclean { identity } => print_json(&service.reclean_photo(&identity).await?),
        Command::RecleanDegraded => {
            let results = service.reclean_degraded().await?;
            info!(count = results.len(), "Re-clean finished");
            print_json(&results)
        }
        Command::Show { identity } => print_json(&service.get_photo(&identity).await?),
        Command::Forget { identity } => {
            service.forget_photo(&identity).await?;
            info!(identity = %identity, "Forgotten");
            Ok(())
        }
        Command::Serve | Command::Stats => Ok(()),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        processor = ?config.processor,
        "Starting idcard-photo"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let service = PhotoService::open(&config).await?;

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(service.clone(), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET    /health                     - Health check");
    info!("  GET    /stats                      - Strategy counters");
    info!("  GET    /photos/{{identity}}          - Photo record");
    info!("  PUT    /photos/{{identity}}          - Submit raw photo URL");
    info!("  POST   /photos/{{identity}}/upload   - Submit raw photo bytes");
    info!("  POST   /photos/{{identity}}/reclean  - Re-run fallback chain");
    info!("  DELETE /photos/{{identity}}          - Forget photo record");
    info!("  GET    /files/{{key}}                - Local objects");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    service.flush().await?;

    let stats = service.stats();
    info!(
        runs = stats.runs,
        local_pipeline = stats.local_pipeline,
        transform_convention = stats.transform_convention,
        passthrough = stats.passthrough,
        "Final pipeline stats"
    );

    Ok(())
}
