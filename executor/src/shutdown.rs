/// Resolves once the process receives SIGINT or SIGTERM. Drives both the
/// HTTP server's graceful shutdown and the reaper's cancellation token.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        let received = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = received, "shutting down");
    }

    #[cfg(not(unix))]
    {
        // Only Ctrl+C is available off Unix.
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        tracing::info!(signal = "ctrl-c", "shutting down");
    }
}
