use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use axum::{http::StatusCode, middleware, response::IntoResponse, Router};
use common_metrics::track_metrics;
use lifecycle::Lifecycle;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::endpoint::Endpoint;

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// The primary service: an HTTP server routing requests to the bound endpoints.
pub struct HttpStack {
    bind: String,
    router: Router,
    running: Mutex<Option<Running>>,
    local_addr: OnceLock<SocketAddr>,
}

impl HttpStack {
    pub fn new(config: &Config, endpoints: Vec<Endpoint>) -> Self {
        Self {
            bind: config.bind(),
            router: router(config, endpoints),
            running: Mutex::new(None),
            local_addr: OnceLock::new(),
        }
    }

    /// The address the server listens on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

pub fn router(config: &Config, endpoints: Vec<Endpoint>) -> Router {
    let app = endpoints
        .into_iter()
        .fold(Router::new(), |app, endpoint| endpoint.mount(app));

    let app = match config.context_root.as_str() {
        "/" => app,
        root => Router::new().nest(root, app),
    };

    app.fallback(not_found)
        .layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout.0))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404")
}

#[async_trait]
impl Lifecycle for HttpStack {
    async fn start_up(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.bind))?;
        let addr = listener.local_addr()?;
        _ = self.local_addr.set(addr);
        info!("listening on {addr}");

        let (shutdown, signal) = oneshot::channel::<()>();
        let router = self.router.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    _ = signal.await;
                })
                .await
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { shutdown, task });
        Ok(())
    }

    async fn shut_down(&self) -> anyhow::Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Running { shutdown, task }) = running {
            _ = shutdown.send(());
            task.await
                .context("server task panicked")?
                .context("server error")?;
            info!("server stopped");
        }
        Ok(())
    }
}
