//! Drives an [`HttpServer`] through one process run: start, wait for a termination request,
//! stop, and map the outcome to the process exit status.

use std::process::ExitCode;

use futures::{Stream, StreamExt};
use lifecycle::{Interrupt, Service};
use tracing::{error, info, warn};

use crate::orchestrator::HttpServer;
use crate::shutdown::ExitHooks;

/// How the process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Started, then reached TERMINATED after a termination request.
    Clean,
    /// Startup failed or was cut short, or shutdown ended in FAILED.
    Failure,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Clean => 0,
            Exit::Failure => 1,
        }
    }
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// Runs `server` until the first termination request on `requests`, then shuts it down.
///
/// A request that arrives while the server is still starting aborts the run: the exit hooks
/// stop whatever did start and the result is [`Exit::Failure`]. Every request after the first
/// one raises `interrupt`, so an operator can cut a slow shutdown short.
pub async fn supervise<S>(
    server: HttpServer,
    exit_hooks: ExitHooks,
    interrupt: Interrupt,
    mut requests: S,
) -> Exit
where
    S: Stream<Item = &'static str> + Unpin + Send + 'static,
{
    server.start_async();

    let started = tokio::select! {
        biased;
        started = server.await_running() => started.map_err(|e| e.to_string()),
        Some(name) = requests.next() => Err(format!("received {name} during startup")),
    };
    if let Err(e) = started {
        error!("Initialization failure: {e}");
        // Stop whatever did start before exiting.
        tokio::select! {
            _ = exit_hooks.run_all() => {}
            Some(name) = requests.next() => {
                warn!("received {name} while running exit hooks, giving up on them");
            }
        }
        return Exit::Failure;
    }
    info!("server running");

    match requests.next().await {
        Some(name) => info!("received {name}, shutting down"),
        None => info!("termination requests closed, shutting down"),
    }

    // Any further request means the operator is not willing to wait for a clean shutdown.
    let escalation = tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            while let Some(name) = requests.next().await {
                warn!("received {name} during shutdown, interrupting");
                interrupt.interrupt();
            }
        }
    });

    let hooks = tokio::spawn({
        let exit_hooks = exit_hooks.clone();
        async move { exit_hooks.run_all().await }
    });
    server.stop_async();
    let terminated = server.await_terminated().await;
    escalation.abort();

    match terminated {
        Ok(()) => {
            if let Err(e) = hooks.await {
                error!("exit hooks failed: {e}");
            }
            info!("server terminated");
            Exit::Clean
        }
        Err(e) => {
            error!("{e}");
            Exit::Failure
        }
    }
}
