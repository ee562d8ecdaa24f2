use thiserror::Error;

/// Errors raised while composing the server from its modules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("service '{0}' is bound more than once")]
    DuplicateService(String),
    #[error("endpoint '{name}' has an invalid path '{path}', paths must be absolute with literal segments only")]
    InvalidEndpointPath { name: String, path: String },
    #[error("endpoint path '{0}' is bound more than once")]
    DuplicateEndpoint(String),
    #[error("a primary service is already bound")]
    PrimaryAlreadyBound,
    #[error("no primary service was bound")]
    MissingPrimary,
}

/// Enumeration of errors that take the server to its failed state.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("invalid bindings: {0}")]
    Bindings(#[from] BindingError),
    #[error("{0}")]
    Startup(String),
    #[error("Termination failure")]
    Termination,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
