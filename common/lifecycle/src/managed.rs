//! A reusable implementation of the [`Service`] state machine.
//!
//! Implementers only provide the work done when starting and stopping through the
//! [`Lifecycle`] trait. [`ManagedService`] runs that work on its own tasks, enforces the
//! transition ordering and delivers transitions to observers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::metrics;
use crate::service::{Observer, ObserverList, Registration, Service, State, Transition};

/// The work performed by a [`ManagedService`] when it starts and stops.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// Brings the component up. An error or a panic moves the service to [`State::Failed`].
    async fn start_up(&self) -> anyhow::Result<()>;

    /// Tears the component down. An error moves the service to [`State::Failed`].
    async fn shut_down(&self) -> anyhow::Result<()>;
}

/// Runs a start or stop hook, turning a panic into an error so the service still settles.
async fn run_hook<F>(hook: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}

struct Status {
    state: State,
    stop_requested: bool,
    cause: Option<Arc<anyhow::Error>>,
}

struct Inner<L> {
    identity: String,
    lifecycle: L,
    status: Mutex<Status>,
    observers: Arc<ObserverList>,
    next_observer: AtomicU64,
    monitor: watch::Sender<State>,
}

/// Drives a [`Lifecycle`] through the service state machine.
///
/// Cloning is cheap and every clone controls the same service.
pub struct ManagedService<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for ManagedService<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Lifecycle> ManagedService<L> {
    pub fn new(identity: impl Into<String>, lifecycle: L) -> Self {
        let (monitor, _) = watch::channel(State::New);
        Self {
            inner: Arc::new(Inner {
                identity: identity.into(),
                lifecycle,
                status: Mutex::new(Status {
                    state: State::New,
                    stop_requested: false,
                    cause: None,
                }),
                observers: Default::default(),
                next_observer: AtomicU64::new(1),
                monitor,
            }),
        }
    }

    pub fn lifecycle(&self) -> &L {
        &self.inner.lifecycle
    }

    /// Waits until the service leaves `New`/`Starting`. Fails unless it is `Running`.
    pub async fn await_running(&self) -> Result<(), LifecycleError> {
        let state = self
            .wait_for(|state| !matches!(state, State::New | State::Starting))
            .await;
        self.expect_state(State::Running, state)
    }

    /// Waits until the service reaches a terminal state. Fails unless it is `Terminated`.
    pub async fn await_terminated(&self) -> Result<(), LifecycleError> {
        let state = self.wait_for(State::is_terminal).await;
        self.expect_state(State::Terminated, state)
    }

    async fn wait_for(&self, predicate: impl FnMut(&State) -> bool) -> State {
        let mut receiver = self.inner.monitor.subscribe();
        let state = match receiver.wait_for(predicate).await {
            Ok(state) => *state,
            // The sender lives as long as `self`, so this is unreachable in practice.
            Err(_) => self.state(),
        };
        state
    }

    fn expect_state(&self, expected: State, actual: State) -> Result<(), LifecycleError> {
        if actual == expected {
            Ok(())
        } else {
            Err(LifecycleError::UnexpectedState {
                identity: self.inner.identity.clone(),
                expected,
                actual,
                cause: self.failure_cause(),
            })
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `to` and notifies observers. Must be called with the status lock held, which
    /// keeps deliveries for this service in transition order.
    fn transition(&self, status: &mut Status, to: State, cause: Option<Arc<anyhow::Error>>) -> bool {
        let from = status.state;
        if !from.can_transition_to(to) {
            warn!(service = %self.inner.identity, %from, %to, "illegal transition rejected");
            return false;
        }

        status.state = to;
        if to == State::Failed {
            status.cause = cause.clone();
        }
        self.inner.monitor.send_replace(to);
        metrics::emit_transition(&self.inner.identity, from, to);
        debug!(service = %self.inner.identity, %from, %to, "service transition");

        let event = Transition { from, to, cause };
        let mut observers = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        if to.is_terminal() {
            // No further transitions: closing the channels ends the delivery tasks.
            observers.clear();
        }
        true
    }

    fn begin_stop(&self, status: &mut Status) {
        if !self.transition(status, State::Stopping, None) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            let result = run_hook(service.inner.lifecycle.shut_down()).await;
            let mut status = service.lock_status();
            match result {
                Ok(()) => {
                    info!(service = %service.inner.identity, "service terminated");
                    service.transition(&mut status, State::Terminated, None);
                }
                Err(e) => {
                    error!(service = %service.inner.identity, "service failed while stopping: {e:#}");
                    service.transition(&mut status, State::Failed, Some(Arc::new(e)));
                }
            }
        });
    }
}

impl<L: Lifecycle> Service for ManagedService<L> {
    fn identity(&self) -> &str {
        &self.inner.identity
    }

    fn state(&self) -> State {
        *self.inner.monitor.borrow()
    }

    fn start_async(&self) {
        let mut status = self.lock_status();
        if status.state != State::New {
            debug!(service = %self.inner.identity, state = %status.state, "start ignored");
            return;
        }
        self.transition(&mut status, State::Starting, None);
        drop(status);

        let service = self.clone();
        tokio::spawn(async move {
            let result = run_hook(service.inner.lifecycle.start_up()).await;
            let mut status = service.lock_status();
            match result {
                Ok(()) => {
                    info!(service = %service.inner.identity, "service running");
                    if service.transition(&mut status, State::Running, None) && status.stop_requested
                    {
                        service.begin_stop(&mut status);
                    }
                }
                Err(e) => {
                    error!(service = %service.inner.identity, "service failed to start: {e:#}");
                    service.transition(&mut status, State::Failed, Some(Arc::new(e)));
                }
            }
        });
    }

    fn stop_async(&self) {
        let mut status = self.lock_status();
        match status.state {
            State::New => {
                self.transition(&mut status, State::Terminated, None);
            }
            State::Starting => status.stop_requested = true,
            State::Running => self.begin_stop(&mut status),
            State::Stopping | State::Terminated | State::Failed => {
                debug!(service = %self.inner.identity, state = %status.state, "stop ignored");
            }
        }
    }

    fn on_transition(&self, observer: Observer) -> Registration {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Transition>();
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        {
            let mut observers = self
                .inner
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.state().is_terminal() {
                return Registration::detached();
            }
            observers.push((id, sender));
        }

        let mut observer = observer;
        tokio::spawn(async move {
            while let Some(transition) = receiver.recv().await {
                observer(&transition);
            }
        });
        Registration::new(id, Arc::downgrade(&self.inner.observers))
    }

    fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
        self.lock_status().cause.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct Scripted {
        fail_start: bool,
        fail_stop: bool,
        hold_start: Option<Arc<Notify>>,
        panic_start: bool,
        panic_stop: bool,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Lifecycle for Scripted {
        async fn start_up(&self) -> anyhow::Result<()> {
            if let Some(gate) = &self.hold_start {
                gate.notified().await;
            }
            if self.panic_start {
                panic!("start exploded");
            }
            if self.fail_start {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn shut_down(&self) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            if self.panic_stop {
                panic!("{} exploded", "stop");
            }
            if self.fail_stop {
                anyhow::bail!("stuck");
            }
            Ok(())
        }
    }

    fn recorder(service: &dyn Service) -> mpsc::UnboundedReceiver<(State, State)> {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(service.on_transition(Box::new(move |t: &Transition| {
            _ = tx.send((t.from, t.to));
        })));
        rx
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<(State, State)>) -> Vec<(State, State)> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn start_then_stop_reports_every_state_in_order() {
        let service = ManagedService::new("one", Scripted::default());
        let mut rx = recorder(&service);

        service.start_async();
        service.await_running().await.unwrap();
        service.stop_async();
        service.await_terminated().await.unwrap();

        assert_eq!(
            drain(&mut rx).await,
            vec![
                (State::New, State::Starting),
                (State::Starting, State::Running),
                (State::Running, State::Stopping),
                (State::Stopping, State::Terminated),
            ]
        );
        assert!(service.lifecycle().stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_start_reports_failed_with_cause() {
        let service = ManagedService::new(
            "one",
            Scripted {
                fail_start: true,
                ..Default::default()
            },
        );
        let mut rx = recorder(&service);

        service.start_async();
        let err = service.await_running().await.unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::UnexpectedState { actual: State::Failed, expected: State::Running, .. }
        ));
        assert!(err.to_string().contains("boom"));
        assert_eq!(service.state(), State::Failed);
        assert_eq!(
            drain(&mut rx).await,
            vec![(State::New, State::Starting), (State::Starting, State::Failed)]
        );
    }

    #[tokio::test]
    async fn panicking_start_reports_failed() {
        let service = ManagedService::new(
            "one",
            Scripted {
                panic_start: true,
                ..Default::default()
            },
        );
        let mut rx = recorder(&service);

        service.start_async();
        let err = tokio::time::timeout(Duration::from_secs(2), service.await_running())
            .await
            .expect("timed out")
            .unwrap_err();

        assert!(err.to_string().contains("panicked: start exploded"), "{err}");
        assert_eq!(service.state(), State::Failed);
        assert_eq!(
            drain(&mut rx).await,
            vec![(State::New, State::Starting), (State::Starting, State::Failed)]
        );
    }

    #[tokio::test]
    async fn panicking_stop_reports_failed() {
        let service = ManagedService::new(
            "one",
            Scripted {
                panic_stop: true,
                ..Default::default()
            },
        );

        service.start_async();
        service.await_running().await.unwrap();
        service.stop_async();
        let err = tokio::time::timeout(Duration::from_secs(2), service.await_terminated())
            .await
            .expect("timed out")
            .unwrap_err();

        assert!(err.to_string().contains("panicked: stop exploded"), "{err}");
        assert_eq!(service.state(), State::Failed);
    }

    #[tokio::test]
    async fn repeated_requests_are_no_ops() {
        let service = ManagedService::new("one", Scripted::default());
        let mut rx = recorder(&service);

        service.start_async();
        service.start_async();
        service.await_running().await.unwrap();
        service.start_async();
        service.stop_async();
        service.stop_async();
        service.await_terminated().await.unwrap();
        service.stop_async();
        service.start_async();

        assert_eq!(drain(&mut rx).await.len(), 4);
        assert_eq!(service.state(), State::Terminated);
    }

    #[tokio::test]
    async fn stop_before_start_terminates_directly() {
        let service = ManagedService::new("one", Scripted::default());

        service.stop_async();

        service.await_terminated().await.unwrap();
        assert!(!service.lifecycle().stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_while_starting_runs_after_start_completes() {
        let gate = Arc::new(Notify::new());
        let service = ManagedService::new(
            "one",
            Scripted {
                hold_start: Some(gate.clone()),
                ..Default::default()
            },
        );

        service.start_async();
        service.stop_async();
        assert_eq!(service.state(), State::Starting);

        gate.notify_one();
        service.await_terminated().await.unwrap();
        assert!(service.lifecycle().stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_stop_is_terminal_failure() {
        let service = ManagedService::new(
            "one",
            Scripted {
                fail_stop: true,
                ..Default::default()
            },
        );

        service.start_async();
        service.await_running().await.unwrap();
        service.stop_async();

        assert!(service.await_terminated().await.is_err());
        assert_eq!(service.state(), State::Failed);
        assert!(service.failure_cause().is_some());
    }

    #[tokio::test]
    async fn cancelled_registration_stops_deliveries() {
        let service = ManagedService::new("one", Scripted::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = service.on_transition(Box::new(move |t: &Transition| {
            _ = tx.send(t.to);
        }));

        assert!(registration.cancel());
        service.start_async();
        service.await_running().await.unwrap();

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn registration_on_terminated_service_is_detached() {
        let service = ManagedService::new("one", Scripted::default());
        service.stop_async();
        service.await_terminated().await.unwrap();

        let registration = service.on_transition(Box::new(|_: &Transition| {}));

        assert!(!registration.cancel());
    }
}
