use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lifecycle::{Service, State};
use tracing::{info, warn};

/// Health reporting for the services of a process.
///
/// Unlike heartbeat-based registries, nothing here reports: the registry holds on to the
/// registered services and reads their lifecycle state when a health check asks for it. A service
/// is healthy while it is running, and unhealthy in every other state. The process is
/// healthy when at least one service is registered and every service is healthy.
///
/// Checks never wait on a service: reading the state is a short, non-blocking lookup, so a
/// check can run concurrently with any transition.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true of all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    Healthy,
    /// Not running, with the state the service is in
    Unhealthy(State),
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy)
    }
}

/// Maps a lifecycle state to a health status. Only a running service is healthy.
pub fn service_status(state: State) -> ComponentStatus {
    match state {
        State::Running => ComponentStatus::Healthy,
        State::New | State::Starting | State::Stopping | State::Terminated | State::Failed => {
            ComponentStatus::Unhealthy(state)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    services: Arc<RwLock<Vec<Arc<dyn Service>>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            services: Default::default(),
        }
    }

    /// Registers a service to be checked by every later health check.
    pub fn register(&self, service: Arc<dyn Service>) {
        match self.services.write() {
            Ok(mut services) => {
                info!(registry = %self.name, service = service.identity(), "registered health check");
                services.push(service);
            }
            // Poisoned lock: Just warn, the health checks will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }

    pub fn len(&self) -> usize {
        self.services.read().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the overall process status, computed from the current state of every
    /// registered service.
    pub fn get_status(&self) -> HealthStatus {
        let services = match self.services.read() {
            Ok(services) => services,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let components: HashMap<String, ComponentStatus> = services
            .iter()
            .map(|service| (service.identity().to_owned(), service_status(service.state())))
            .collect();

        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());
        let result = HealthStatus {
            healthy,
            components,
        };
        if !healthy {
            info!("{} health check failed: {:?}", self.name, result);
        }
        result
    }
}
