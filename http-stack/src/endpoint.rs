use axum::{middleware, Router};
use common_metrics::{track_status_codes, StatusCodeCounters};

use crate::error::BindingError;

/// Whether a router can be nested at `path`: "/" or an absolute path of literal segments,
/// none of them empty, a capture (`:`) or a wildcard (`*`).
pub(crate) fn is_mount_path(path: &str) -> bool {
    match path.strip_prefix('/') {
        Some("") => true,
        Some(rest) => rest
            .split('/')
            .all(|segment| !segment.is_empty() && !segment.starts_with([':', '*'])),
        None => false,
    }
}

/// A router served under a fixed path, with its own response status counters.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    path: String,
    router: Router,
    status_codes: StatusCodeCounters,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        router: Router,
    ) -> Result<Self, BindingError> {
        let name = name.into();
        let path = path.into();
        if !is_mount_path(&path) {
            return Err(BindingError::InvalidEndpointPath { name, path });
        }

        let status_codes = StatusCodeCounters::new(format!("{path} {name}"));
        Ok(Self {
            name,
            path,
            router,
            status_codes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status_codes(&self) -> &StatusCodeCounters {
        &self.status_codes
    }

    /// Mounts the endpoint's routes under its path on `app`.
    pub(crate) fn mount(self, app: Router) -> Router {
        let router = self.router.layer(middleware::from_fn_with_state(
            self.status_codes,
            track_status_codes,
        ));
        // Nesting at the root is not supported by axum, merge instead.
        if self.path == "/" {
            app.merge(router)
        } else {
            app.nest(&self.path, router)
        }
    }
}
