use owo_colors::OwoColorize;

/// Resolves once the process has been asked to stop: Ctrl+C in a
/// terminal, or the SIGTERM the kubelet sends before killing the pod.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");

        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        eprintln!("{}", format!("🛑 {received} received, shutting down").red());
    }

    #[cfg(not(unix))]
    {
        // Windows and friends only get Ctrl+C.
        tokio::signal::ctrl_c().await.expect("Ctrl+C handler");
        eprintln!("{}", "🛑 Ctrl+C received, shutting down".red());
    }
}
