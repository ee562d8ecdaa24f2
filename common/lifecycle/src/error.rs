//! Lifecycle error types.

use std::sync::Arc;

use thiserror::Error;

use crate::service::State;

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// A service settled in a state other than the one the caller waited for.
    #[error("expected service '{identity}' to be {expected}, but it is {actual}{}", cause_suffix(.cause))]
    UnexpectedState {
        identity: String,
        expected: State,
        actual: State,
        cause: Option<Arc<anyhow::Error>>,
    },

    /// The observer backing a transition future went away before writing an outcome.
    #[error("transition of service '{identity}' to {expected} was abandoned")]
    Abandoned { identity: String, expected: State },
}

fn cause_suffix(cause: &Option<Arc<anyhow::Error>>) -> String {
    match cause {
        Some(cause) => format!(": {cause:#}"),
        None => String::new(),
    }
}
