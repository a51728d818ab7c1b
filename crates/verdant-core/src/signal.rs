//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}

/// Cancel `token` on the first shutdown signal, or when the token is
/// cancelled by someone else.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        result = shutdown_signal() => match result {
            Ok(signal) => info!(message = "Signal received.", signal),
            Err(e) => warn!(error = %e, "Failed to install signal handlers, shutting down"),
        },
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_on_signal_returns_when_token_cancelled() {
        let token = CancellationToken::new();
        let task = tokio::spawn(cancel_on_signal(token.clone()));

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher should exit once the token is cancelled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_tokens_follow_parent() {
        let parent = CancellationToken::new();
        let intake = parent.child_token();
        let engine = parent.child_token();

        intake.cancel();
        assert!(!parent.is_cancelled());
        assert!(!engine.is_cancelled());

        parent.cancel();
        assert!(engine.is_cancelled());
    }
}
