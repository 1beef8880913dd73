//! Shoots Flight server binary
//!
//! Serves Parquet datasets grouped into buckets over Arrow Flight.

use shoots::config::{
    ServerConfig, DEFAULT_BUCKET_DIR, DEFAULT_HOST, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_PORT,
    DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_TOKEN_TTL_SECS,
};
use shoots::server::{ShootsServer, ShutdownHandle};
use shoots::telemetry::Telemetry;

use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

/// Shoots Flight server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "SHOOTS_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Bind port
    #[arg(long, env = "SHOOTS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding one sub-directory per bucket
    #[arg(long, env = "SHOOTS_BUCKET_DIR", default_value = DEFAULT_BUCKET_DIR)]
    bucket_dir: PathBuf,

    /// PEM certificate; enables TLS together with --key-file
    #[arg(long, env = "SHOOTS_CERT_FILE", requires = "key_file")]
    cert_file: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "SHOOTS_KEY_FILE", requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// Token signing secret; enables authentication
    #[arg(long, env = "SHOOTS_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Seconds in-flight calls get to finish after shutdown
    #[arg(long, env = "SHOOTS_SHUTDOWN_GRACE_SECS", default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS)]
    shutdown_grace_secs: u64,

    /// Default admin token lifetime in seconds
    #[arg(long, env = "SHOOTS_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    token_ttl_secs: u64,

    /// Largest gRPC message accepted or sent
    #[arg(long, env = "SHOOTS_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Log level
    #[arg(long, env = "SHOOTS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            bucket_dir: args.bucket_dir,
            cert_file: args.cert_file,
            key_file: args.key_file,
            secret: args.secret.filter(|s| !s.is_empty()),
            shutdown_grace_secs: args.shutdown_grace_secs,
            token_ttl_secs: args.token_ttl_secs,
            max_message_bytes: args.max_message_bytes,
            log_level: args.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry = Telemetry::init("shoots-server", &args.log_level)?;

    let config = ServerConfig::from(args);
    info!(
        location = %config.location(),
        bucket_dir = %config.bucket_dir.display(),
        "Starting Shoots server"
    );

    let server = ShootsServer::new(config).await?;
    if let Some(token) = server.admin_token()? {
        info!(token = %token, "Admin token");
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(forward_signals(shutdown));

    server.serve().await?;
    info!("Shoots server shut down");
    Ok(())
}

/// Trigger `shutdown` on SIGINT or SIGTERM.
async fn forward_signals(shutdown: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.wait() => return,
    }
    info!("Shutdown signal received");
    shutdown.trigger();
}
