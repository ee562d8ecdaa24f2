//! Service lifecycle primitives: the service contract and its managed state machine,
//! one-shot transition futures, and the fan-out/fan-in coordinator used to start and stop
//! a set of services together.

mod coordinator;
mod error;
mod interrupt;
mod managed;
mod metrics;
mod service;
mod transition;

pub use coordinator::{apply, apply_and_wait, watch_transition, Action};
pub use error::LifecycleError;
pub use interrupt::Interrupt;
pub use managed::{Lifecycle, ManagedService};
pub use service::{Observer, Registration, Service, State, Transition};
pub use transition::{transition, TransitionFuture, TransitionPromise};
