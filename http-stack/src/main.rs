//! Bootstrap and control the HTTP stack server.
use std::process::ExitCode;

use common_metrics::setup_metrics_recorder;
use envconfig::Envconfig;
use futures::stream;
use http_server::TerminationSignals;
use lifecycle::{Interrupt, ManagedService};
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use http_stack::config::Config;
use http_stack::error::ServerError;
use http_stack::orchestrator::{default_modules, HttpServer, Orchestrator};
use http_stack::shutdown::ExitHooks;
use http_stack::supervisor::supervise;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn main() -> ExitCode {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let runtime = match config.build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Initialization failure: {}", ServerError::from(e));
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let recorder = match setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("failed to install metrics recorder: {e}");
            None
        }
    };

    let signals = match TerminationSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("Initialization failure: {}", ServerError::from(e));
            return ExitCode::FAILURE;
        }
    };

    let exit_hooks = ExitHooks::new();
    let interrupt = Interrupt::new();
    let modules = default_modules(&config, recorder);
    let server: HttpServer = ManagedService::new(
        "http-server",
        Orchestrator::new(config, modules, exit_hooks.clone(), interrupt.clone()),
    );

    let requests = Box::pin(stream::unfold(signals, |mut signals| async move {
        let name = signals.recv().await;
        Some((name, signals))
    }));

    supervise(server, exit_hooks, interrupt, requests).await.into()
}
