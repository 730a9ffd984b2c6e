//! Inlet server binary.
//!
//! Builds the scope configuration from CLI arguments, wires the upload
//! handler into an Axum router, and serves it until shutdown.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use clap::Parser;
use tokio::signal;
use tracing::info;

use inlet::config::{Args, ScopeConfig};
use inlet::logging;
use inlet::signature::SystemClock;
use inlet::storage::LocalStore;
use inlet::upload;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let config = ScopeConfig::from_args(&args)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);

    info!(
        scope = %config.scope,
        write_to = %config.write_to.display(),
        webdav = config.enable_webdav,
        authenticated = !config.hmac_secrets.is_empty(),
        "upload handler configured"
    );

    let storage: upload::SharedStorage = Arc::new(LocalStore::new(config.write_to.clone()));
    let clock: upload::SharedClock = Arc::new(SystemClock);
    let app = upload::app(Arc::new(config), storage, clock);

    let handle = Handle::new();
    info!("🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
