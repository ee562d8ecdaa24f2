use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::BindingError;
use crate::module::{Bindings, Module};

/// Binds the operational endpoints: the Prometheus scrape endpoint and the health check.
/// Either is skipped when its path is configured empty.
pub struct MetricsModule {
    metrics_path: String,
    health_path: String,
    recorder: Option<PrometheusHandle>,
}

impl MetricsModule {
    pub fn new(config: &Config, recorder: Option<PrometheusHandle>) -> Self {
        Self {
            metrics_path: config.metrics_path.clone(),
            health_path: config.health_path.clone(),
            recorder,
        }
    }
}

impl Module for MetricsModule {
    fn name(&self) -> &str {
        "metrics"
    }

    fn configure(&self, bindings: &mut Bindings) -> Result<(), BindingError> {
        if self.metrics_path.is_empty() {
            info!("metrics endpoint disabled");
        } else {
            let recorder = self.recorder.clone();
            let router = Router::new().route(
                "/",
                get(move || {
                    let rendered = recorder.as_ref().map(PrometheusHandle::render);
                    async move {
                        match rendered {
                            Some(body) => (StatusCode::OK, body),
                            None => (
                                StatusCode::SERVICE_UNAVAILABLE,
                                "no metrics recorder installed".to_owned(),
                            ),
                        }
                    }
                }),
            );
            bindings.bind_endpoint(Endpoint::new("metrics", &self.metrics_path, router)?)?;
        }

        if self.health_path.is_empty() {
            info!("health endpoint disabled");
        } else {
            let health = bindings.health();
            let router = Router::new().route(
                "/",
                get(move || {
                    let status = health.get_status();
                    async move { status.into_response() }
                }),
            );
            bindings.bind_endpoint(Endpoint::new("health", &self.health_path, router)?)?;
        }

        Ok(())
    }
}
