/// Signal handling for graceful shutdown.
///
/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM so the caller can stop
/// the monitor and let it terminate the VPN client.
use tokio::signal::unix::{signal, SignalKind};

/// Which signal requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM. A handler that fails to install is
/// skipped and the other signal is still watched.
pub async fn shutdown_signal() -> ShutdownSignal {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };

    let sigterm = async {
        match term.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let sigint = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sigint => ShutdownSignal::Interrupt,
        _ = sigterm => ShutdownSignal::Terminate,
    }
}
