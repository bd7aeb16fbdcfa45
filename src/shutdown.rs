use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Installs SIGTERM/SIGINT handling for the node lifecycle.
///
/// The first signal cancels the returned token: the raft loop stops its
/// election and heartbeat timers, leader-router retries and in-flight RPCs
/// observe the cancellation, and the cluster endpoint drains. A second
/// signal aborts the process for the case where draining never finishes
/// (a peer holding a connection open, a stuck handler).
pub fn install_shutdown_handler() -> CancellationToken {
    let lifecycle = CancellationToken::new();
    let token = lifecycle.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutdown requested, cancelling node lifecycle");
        token.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal before drain completed, aborting");
        std::process::exit(1);
    });

    lifecycle
}
