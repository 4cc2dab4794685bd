//! Termination signal handling.
//!
//! Consumers dispose themselves when the process receives SIGINT (Ctrl+C) or SIGTERM.
//! The hook is a task that waits on [`termination_signal`]; the consumer aborts that task
//! when it is disposed, so a signal arriving later never touches a torn-down instance.

use std::fmt;
use tracing::warn;

/// Signal that requested termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
        }
    }
}

/// Resolves when a termination signal is received.
///
/// If a handler can not be installed the corresponding branch never resolves.
pub async fn termination_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        ShutdownSignal::SigInt
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        ShutdownSignal::SigTerm
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_display() {
        assert_eq!(ShutdownSignal::SigInt.to_string(), "SIGINT (Ctrl+C)");
        assert_eq!(ShutdownSignal::SigTerm.to_string(), "SIGTERM");
    }
}
