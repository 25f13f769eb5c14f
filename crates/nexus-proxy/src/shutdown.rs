use tokio::sync::watch;

/// Resolves once SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives. Usable
/// directly as `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Drives a `watch<bool>` from `false` to `true` once [`signal`] resolves,
/// so the analysis worker's poll loop (which has no axum future to hook
/// into) can observe shutdown the same way the HTTP server does.
pub fn watch_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub async fn drive(tx: watch::Sender<bool>) {
    signal().await;
    let _ = tx.send(true);
}
