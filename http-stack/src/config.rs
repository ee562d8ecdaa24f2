use std::num::NonZeroUsize;
use std::str::FromStr;
use std::{io, thread, time};

use envconfig::Envconfig;
use tokio::runtime::{Builder, Runtime};

use crate::endpoint::is_mount_path;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Installation directory. Not needed to parse the configuration, but the server
    /// refuses to start without it.
    #[envconfig(from = "HTTP_STACK_HOME")]
    pub home: Option<String>,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "/")]
    pub context_root: ContextRoot,

    /// Empty to disable the metrics endpoint.
    #[envconfig(default = "/metrics")]
    pub metrics_path: String,

    /// Empty to disable the health endpoint.
    #[envconfig(default = "/_health")]
    pub health_path: String,

    /// 0 to use the parallelism reported by the OS.
    #[envconfig(default = "0")]
    pub available_processors: usize,

    /// Per processor.
    #[envconfig(default = "1")]
    pub worker_threads: usize,

    /// Per processor.
    #[envconfig(default = "64")]
    pub max_blocking_threads: usize,

    #[envconfig(default = "60000")]
    pub idle_timeout: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub request_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn processors(&self) -> usize {
        if self.available_processors > 0 {
            return self.available_processors;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Builds the multi-threaded runtime the server runs on, sized from the processor count.
    pub fn build_runtime(&self) -> io::Result<Runtime> {
        let processors = self.processors();
        Builder::new_multi_thread()
            .worker_threads((self.worker_threads * processors).max(1))
            .max_blocking_threads((self.max_blocking_threads * processors).max(1))
            .thread_keep_alive(self.idle_timeout.0)
            .thread_name("http-stack")
            .enable_all()
            .build()
    }

    /// Configuration for tests: loopback on an ephemeral port.
    pub fn default_test_config() -> Self {
        Self {
            home: Some("/tmp".to_owned()),
            host: "127.0.0.1".to_owned(),
            port: 0,
            context_root: ContextRoot::root(),
            metrics_path: "/metrics".to_owned(),
            health_path: "/_health".to_owned(),
            available_processors: 1,
            worker_threads: 1,
            max_blocking_threads: 1,
            idle_timeout: EnvMsDuration(time::Duration::from_secs(1)),
            request_timeout: EnvMsDuration(time::Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Path prefix every endpoint is served under: "/" or an absolute path of literal segments.
/// A trailing "/" is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRoot(String);

impl ContextRoot {
    pub fn root() -> Self {
        ContextRoot("/".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidContextRootError(pub String);

impl FromStr for ContextRoot {
    type Err = InvalidContextRootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() && s.starts_with('/') {
            return Ok(ContextRoot::root());
        }
        if !is_mount_path(trimmed) {
            return Err(InvalidContextRootError(s.to_owned()));
        }
        Ok(ContextRoot(trimmed.to_owned()))
    }
}
