//! The service contract consumed by the coordinator and the health registry.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

/// Lifecycle state of a service.
///
/// States only move forward along `New -> Starting -> Running -> Stopping -> Terminated`,
/// and any non-terminal state may divert to `Failed`. `Terminated` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl State {
    pub const ALL: [State; 6] = [
        State::New,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Terminated,
        State::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Terminated | State::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Terminated => "TERMINATED",
            State::Failed => "FAILED",
        }
    }

    /// Position along the canonical sequence, `Failed` excluded.
    fn ordinal(&self) -> Option<u8> {
        match self {
            State::New => Some(0),
            State::Starting => Some(1),
            State::Running => Some(2),
            State::Stopping => Some(3),
            State::Terminated => Some(4),
            State::Failed => None,
        }
    }

    /// Whether moving from `self` to `to` respects the lifecycle ordering.
    pub fn can_transition_to(&self, to: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), to.ordinal()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state change, as delivered to observers.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: State,
    pub to: State,
    /// Set when `to` is [`State::Failed`].
    pub cause: Option<Arc<anyhow::Error>>,
}

/// Callback invoked for every transition after registration, in order.
pub type Observer = Box<dyn FnMut(&Transition) + Send + 'static>;

/// Lifecycle control surface of a long-running component.
///
/// `start_async` and `stop_async` never block: they request a transition and return.
/// Requesting a transition that is already satisfied or in progress is a no-op.
pub trait Service: Send + Sync + 'static {
    /// Stable, human readable label used in logs and health reports.
    fn identity(&self) -> &str;

    /// Snapshot of the current state. Never blocks on an ongoing transition.
    fn state(&self) -> State;

    fn start_async(&self);

    fn stop_async(&self);

    /// Registers an observer for future transitions.
    ///
    /// Each registration is served by its own delivery task, so a slow observer never
    /// holds up the service or other observers. Must be called within a Tokio runtime.
    fn on_transition(&self, observer: Observer) -> Registration;

    /// Cause of the failure, once the service reached [`State::Failed`].
    fn failure_cause(&self) -> Option<Arc<anyhow::Error>>;
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) type ObserverList = Mutex<Vec<(u64, mpsc::UnboundedSender<Transition>)>>;

/// Handle to a registered observer.
///
/// Dropping the handle keeps the observer registered; call [`Registration::cancel`] to stop
/// deliveries. Observers are released automatically once the service reaches a terminal state.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    observers: Weak<ObserverList>,
}

impl Registration {
    pub(crate) fn new(id: u64, observers: Weak<ObserverList>) -> Self {
        Self { id, observers }
    }

    /// A registration that was never attached to a live service.
    pub fn detached() -> Self {
        Self {
            id: 0,
            observers: Weak::new(),
        }
    }

    /// Removes the observer. Returns false if it was already released.
    pub fn cancel(self) -> bool {
        let Some(observers) = self.observers.upgrade() else {
            return false;
        };
        let Ok(mut observers) = observers.lock() else {
            return false;
        };
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        observers.len() != before
    }
}
