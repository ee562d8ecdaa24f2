pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics_module;
pub mod module;
pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod supervisor;
