//! The server's master controller.
//!
//! [`Orchestrator`] is the lifecycle behind [`HttpServer`]. Starting it composes the
//! modules, starts the supporting services, and only once all of them run, starts the
//! primary. Stopping it runs the reverse sequence held by its shutdown hook: the primary
//! first, then the supporting services.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use health::HealthRegistry;
use lifecycle::{apply_and_wait, Action, Interrupt, Lifecycle, ManagedService, Service};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::metrics_module::MetricsModule;
use crate::module::{Bindings, Components, HttpModule, Module};
use crate::shutdown::{ExitHooks, ShutdownHook};

pub const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";

pub type HttpServer = ManagedService<Orchestrator>;

/// The modules a server is composed of unless told otherwise.
pub fn default_modules(config: &Config, recorder: Option<PrometheusHandle>) -> Vec<Box<dyn Module>> {
    vec![
        Box::new(HttpModule::new(config)),
        Box::new(MetricsModule::new(config, recorder)),
    ]
}

pub struct Orchestrator {
    config: Config,
    modules: Vec<Box<dyn Module>>,
    exit_hooks: ExitHooks,
    interrupt: Interrupt,
    hook: Mutex<Option<ShutdownHook>>,
    health: OnceLock<HealthRegistry>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        modules: Vec<Box<dyn Module>>,
        exit_hooks: ExitHooks,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            config,
            modules,
            exit_hooks,
            interrupt,
            hook: Mutex::new(None),
            health: OnceLock::new(),
        }
    }

    /// Health of every composed service, available once startup got past composition.
    pub fn health(&self) -> Option<HealthRegistry> {
        self.health.get().cloned()
    }

    fn check_preconditions(&self) -> Result<&str, ServerError> {
        match self.config.home.as_deref() {
            Some(home) if !home.is_empty() => Ok(home),
            _ => Err(ServerError::Precondition(
                "must set HTTP_STACK_HOME to start".to_owned(),
            )),
        }
    }

    fn compose(&self) -> Result<Components, ServerError> {
        let mut bindings = Bindings::new();
        for module in &self.modules {
            info!(module = module.name(), "configuring module");
            module.configure(&mut bindings)?;
        }
        Ok(bindings.finish()?)
    }

    fn take_hook(&self) -> Option<ShutdownHook> {
        self.hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// The reverse sequence: stop the primary and wait for it, then stop the supporting set.
fn shutdown_sequence(
    primary: Arc<dyn Service>,
    services: Vec<Arc<dyn Service>>,
    interrupt: Interrupt,
) -> ShutdownHook {
    ShutdownHook::new("http-server shutdown", async move {
        info!("Shutdown initiated. Shutting down server...");

        let primary_stopped = apply_and_wait(&[primary], Action::Stop, &interrupt).await;
        if !primary_stopped {
            warn!("primary service did not stop cleanly");
        }

        let services_stopped = apply_and_wait(&services, Action::Stop, &interrupt).await;
        if !services_stopped {
            error!("Failure stopping services");
        }

        let clean = primary_stopped && services_stopped;
        metrics::counter!(METRIC_SHUTDOWN_COMPLETED, "clean" => clean.to_string()).increment(1);
    })
}

#[async_trait]
impl Lifecycle for Orchestrator {
    async fn start_up(&self) -> anyhow::Result<()> {
        let home = self.check_preconditions()?;
        info!("HTTP stack home set to {home}");

        let Components {
            services,
            primary,
            health,
        } = self.compose()?;
        if self.health.set(health).is_err() {
            warn!("health registry already set, keeping the first one");
        }

        let hook = shutdown_sequence(primary.clone(), services.clone(), self.interrupt.clone());
        self.exit_hooks.register(hook.clone());
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);

        let names: Vec<&str> = services.iter().map(|s| s.identity()).collect();
        info!("Services installed: {}", names.join(", "));

        if !apply_and_wait(&services, Action::Start, &self.interrupt).await {
            return Err(ServerError::Startup("Failure starting services".to_owned()).into());
        }
        if !apply_and_wait(&[primary], Action::Start, &self.interrupt).await {
            return Err(ServerError::Startup("Failure starting primary service".to_owned()).into());
        }
        Ok(())
    }

    async fn shut_down(&self) -> anyhow::Result<()> {
        let Some(hook) = self.take_hook() else {
            return Ok(());
        };

        // Only interrupts raised from here on can cut the wait short.
        let interrupted = self.interrupt.subsequent();

        // Run outside the exit hooks: make sure they will not run it a second time.
        self.exit_hooks.unregister(&hook);

        tokio::select! {
            biased;
            _ = hook.run() => Ok(()),
            _ = interrupted => {
                error!("interrupted while waiting for the shutdown sequence");
                Err(ServerError::Termination.into())
            }
        }
    }
}
