use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Listens for the termination signals sent by process managers (SIGTERM) and by a
/// terminal (SIGINT, typically Ctrl+C).
///
/// Handlers are installed once and stay installed: every later delivery of either signal
/// is reported by [`TerminationSignals::recv`] instead of terminating the process.
///
/// # Platform Support
///
/// Unix only.
pub struct TerminationSignals {
    term: Signal,
    interrupt: Signal,
}

impl TerminationSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Completes on the next SIGTERM or SIGINT, returning the signal name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        };
        info!("received {name}");
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_termination_signals() {
        let mut signals = TerminationSignals::install().unwrap();

        // Should timeout because no signal was sent
        let result = timeout(Duration::from_millis(100), signals.recv()).await;
        assert!(
            result.is_err(),
            "recv should not complete without a signal"
        );

        // The handler is installed, so this no longer terminates the test process.
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let name = timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("signal not received");
        assert_eq!(name, "SIGTERM");
    }
}
