//! Command implementations for the quic-tunnel binary

pub mod client;
pub mod server;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over the level from the config file.
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(quic_tunnel::config::log_filter(log_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Token cancelled on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> tokio_util::sync::CancellationToken {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {e}"),
        }
        token.cancel();
    });
    shutdown
}
