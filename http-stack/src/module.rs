//! Composition of the server from modules.
//!
//! Each [`Module`] contributes services, endpoints, or the primary service to a shared
//! [`Bindings`]. Once every module is configured, [`Bindings::finish`] builds the primary
//! from the collected endpoints and hands back the [`Components`] the orchestrator runs.

use std::collections::HashSet;
use std::sync::Arc;

use health::HealthRegistry;
use lifecycle::{ManagedService, Service};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::BindingError;
use crate::server::HttpStack;

pub type PrimaryFactory = Box<dyn FnOnce(Vec<Endpoint>) -> Arc<dyn Service> + Send>;

pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, bindings: &mut Bindings) -> Result<(), BindingError>;
}

pub struct Bindings {
    services: Vec<Arc<dyn Service>>,
    identities: HashSet<String>,
    endpoints: Vec<Endpoint>,
    primary: Option<PrimaryFactory>,
    health: HealthRegistry,
}

/// Everything the orchestrator needs for one start/stop cycle.
pub struct Components {
    /// The supporting set, started before and stopped after the primary.
    pub services: Vec<Arc<dyn Service>>,
    pub primary: Arc<dyn Service>,
    pub health: HealthRegistry,
}

impl Default for Bindings {
    fn default() -> Self {
        Self::new()
    }
}

impl Bindings {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            identities: HashSet::new(),
            endpoints: Vec::new(),
            primary: None,
            health: HealthRegistry::new("liveness"),
        }
    }

    pub fn bind_service(&mut self, service: Arc<dyn Service>) -> Result<(), BindingError> {
        if !self.identities.insert(service.identity().to_owned()) {
            return Err(BindingError::DuplicateService(
                service.identity().to_owned(),
            ));
        }
        self.services.push(service);
        Ok(())
    }

    pub fn bind_endpoint(&mut self, endpoint: Endpoint) -> Result<(), BindingError> {
        if self.endpoints.iter().any(|e| e.path() == endpoint.path()) {
            return Err(BindingError::DuplicateEndpoint(endpoint.path().to_owned()));
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Binds the factory building the primary service from every bound endpoint.
    pub fn bind_primary<F>(&mut self, factory: F) -> Result<(), BindingError>
    where
        F: FnOnce(Vec<Endpoint>) -> Arc<dyn Service> + Send + 'static,
    {
        if self.primary.is_some() {
            return Err(BindingError::PrimaryAlreadyBound);
        }
        self.primary = Some(Box::new(factory));
        Ok(())
    }

    /// The registry every bound service is reported to. Services bound later show up in it
    /// too.
    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn finish(self) -> Result<Components, BindingError> {
        let factory = self.primary.ok_or(BindingError::MissingPrimary)?;
        let primary = factory(self.endpoints);
        if self.identities.contains(primary.identity()) {
            return Err(BindingError::DuplicateService(primary.identity().to_owned()));
        }

        for service in &self.services {
            self.health.register(service.clone());
        }
        self.health.register(primary.clone());

        Ok(Components {
            services: self.services,
            primary,
            health: self.health,
        })
    }
}

/// Binds the HTTP transport: the primary service serving every bound endpoint.
pub struct HttpModule {
    config: Config,
}

impl HttpModule {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Module for HttpModule {
    fn name(&self) -> &str {
        "http"
    }

    fn configure(&self, bindings: &mut Bindings) -> Result<(), BindingError> {
        let config = self.config.clone();
        bindings.bind_primary(move |endpoints| -> Arc<dyn Service> {
            Arc::new(ManagedService::new(
                "http-stack",
                HttpStack::new(&config, endpoints),
            ))
        })
    }
}
