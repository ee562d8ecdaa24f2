//! Fan-out/fan-in over a set of services.
//!
//! [`apply_and_wait`] issues the same action to every member at once, then waits for every
//! member to settle before folding the outcomes into a single verdict. It never returns
//! early: a member that fails is logged and counted, and the wait for the others goes on,
//! so every member's final state is visible in the logs.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::interrupt::Interrupt;
use crate::metrics;
use crate::service::{Service, State, Transition};
use crate::transition::{transition, TransitionFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    /// The state each member is expected to reach.
    pub fn expected(&self) -> State {
        match self {
            Action::Start => State::Running,
            Action::Stop => State::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }

    fn issue(&self, service: &dyn Service) {
        match self {
            Action::Start => service.start_async(),
            Action::Stop => service.stop_async(),
        }
    }

    /// Whether reaching `state` settles the outcome of this action.
    fn settled_by(&self, state: State) -> bool {
        state == self.expected() || state.is_terminal()
    }
}

/// Returns a future resolved with the first state of `service` that settles `action`:
/// the expected state, or a terminal state otherwise.
pub fn watch_transition(service: &dyn Service, action: Action) -> TransitionFuture {
    let (promise, future) = transition(service.identity(), action.expected());
    let promise = Arc::new(promise);

    let observer_promise = promise.clone();
    drop(service.on_transition(Box::new(move |t: &Transition| {
        if action.settled_by(t.to) {
            observer_promise.complete(t.to);
        }
    })));

    // The service may already be past the point the observer can see.
    let current = service.state();
    if action.settled_by(current) {
        promise.complete(current);
    }
    future
}

/// Watches `service` for `action`, then issues it.
pub fn apply(service: &dyn Service, action: Action) -> TransitionFuture {
    let future = watch_transition(service, action);
    action.issue(service);
    future
}

/// Applies `action` to every service concurrently and waits for all of them to settle.
///
/// Returns true if and only if every service reached the expected state. Individual
/// failures are logged with the service identity and folded into the verdict.
pub async fn apply_and_wait(
    services: &[Arc<dyn Service>],
    action: Action,
    interrupt: &Interrupt,
) -> bool {
    let started = Instant::now();
    let futures: Vec<_> = services
        .iter()
        .map(|service| apply(service.as_ref(), action))
        .collect();

    let outcomes = join_all(
        services
            .iter()
            .zip(futures)
            .map(|(service, future)| resolve(service.as_ref(), future, interrupt)),
    )
    .await;

    let success = outcomes.iter().all(|reached| *reached);
    metrics::emit_fanout_verdict(action.as_str(), success, started.elapsed().as_secs_f64());
    success
}

async fn resolve(service: &dyn Service, mut future: TransitionFuture, interrupt: &Interrupt) -> bool {
    let identity = service.identity().to_owned();
    let expected = future.expected();
    let mut interrupted = interrupt.is_interrupted();

    loop {
        tokio::select! {
            outcome = future.wait() => {
                return match outcome {
                    Ok(state) if state == expected => {
                        debug!(service = %identity, %state, "service reached expected state");
                        true
                    }
                    Ok(state) => {
                        match service.failure_cause() {
                            Some(cause) => warn!(
                                service = %identity, %expected, actual = %state,
                                "service did not reach the expected state: {cause:#}"
                            ),
                            None => warn!(
                                service = %identity, %expected, actual = %state,
                                "service did not reach the expected state"
                            ),
                        }
                        false
                    }
                    Err(e) => {
                        warn!(service = %identity, "Service control failure: {e}");
                        false
                    }
                };
            }
            _ = interrupt.interrupted(), if !interrupted => {
                interrupted = true;
                warn!(service = %identity, %expected, "Service control failure: interrupted, still waiting for outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::managed::{Lifecycle, ManagedService};
    use crate::service::{Observer, Registration};

    struct Fake {
        fail_start: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Lifecycle for Fake {
        async fn start_up(&self) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_start {
                anyhow::bail!("refused to start");
            }
            Ok(())
        }

        async fn shut_down(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn healthy(name: &str) -> Arc<dyn Service> {
        Arc::new(ManagedService::new(
            name,
            Fake {
                fail_start: false,
                gate: None,
            },
        ))
    }

    fn failing(name: &str) -> Arc<dyn Service> {
        Arc::new(ManagedService::new(
            name,
            Fake {
                fail_start: true,
                gate: None,
            },
        ))
    }

    /// Accepts observers and then drops them without ever notifying.
    struct Mute;

    impl Service for Mute {
        fn identity(&self) -> &str {
            "mute"
        }
        fn state(&self) -> State {
            State::Starting
        }
        fn start_async(&self) {}
        fn stop_async(&self) {}
        fn on_transition(&self, _observer: Observer) -> Registration {
            Registration::detached()
        }
        fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
            None
        }
    }

    #[tokio::test]
    async fn all_running_is_success() {
        let services: Vec<_> = (0..5).map(|i| healthy(&format!("s{i}"))).collect();

        assert!(apply_and_wait(&services, Action::Start, &Interrupt::new()).await);
        for service in &services {
            assert_eq!(service.state(), State::Running);
        }

        assert!(apply_and_wait(&services, Action::Stop, &Interrupt::new()).await);
        for service in &services {
            assert_eq!(service.state(), State::Terminated);
        }
    }

    #[tokio::test]
    async fn empty_set_is_success() {
        assert!(apply_and_wait(&[], Action::Start, &Interrupt::new()).await);
    }

    #[tokio::test]
    async fn one_failure_fails_the_verdict_after_everyone_settled() {
        let gate = Arc::new(Notify::new());
        let slow: Arc<dyn Service> = Arc::new(ManagedService::new(
            "slow",
            Fake {
                fail_start: false,
                gate: Some(gate.clone()),
            },
        ));
        let services = vec![failing("broken"), slow.clone(), healthy("fine")];

        let verdict = tokio::spawn({
            let services = services.clone();
            async move { apply_and_wait(&services, Action::Start, &Interrupt::new()).await }
        });

        // The failure is already known, but the verdict waits for the slow member.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(services[0].state(), State::Failed);
        assert!(!verdict.is_finished());

        gate.notify_one();
        let verdict = tokio::time::timeout(Duration::from_secs(5), verdict)
            .await
            .expect("timed out")
            .unwrap();
        assert!(!verdict);
        assert_eq!(slow.state(), State::Running);
        assert_eq!(services[2].state(), State::Running);
    }

    #[tokio::test]
    async fn already_settled_members_resolve_immediately() {
        let service = healthy("one");
        service.start_async();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.state(), State::Running);

        let verdict = tokio::time::timeout(
            Duration::from_secs(1),
            apply_and_wait(&[service], Action::Start, &Interrupt::new()),
        )
        .await
        .expect("timed out");
        assert!(verdict);
    }

    #[tokio::test]
    async fn abandoned_transition_is_a_failure() {
        let services: Vec<Arc<dyn Service>> = vec![Arc::new(Mute), healthy("fine")];

        let verdict = tokio::time::timeout(
            Duration::from_secs(1),
            apply_and_wait(&services, Action::Start, &Interrupt::new()),
        )
        .await
        .expect("timed out");

        assert!(!verdict);
        assert_eq!(services[1].state(), State::Running);
    }

    #[tokio::test]
    async fn interrupt_does_not_abandon_the_wait() {
        let gate = Arc::new(Notify::new());
        let slow: Arc<dyn Service> = Arc::new(ManagedService::new(
            "slow",
            Fake {
                fail_start: false,
                gate: Some(gate.clone()),
            },
        ));
        let interrupt = Interrupt::new();

        let verdict = tokio::spawn({
            let services = vec![slow.clone()];
            let interrupt = interrupt.clone();
            async move { apply_and_wait(&services, Action::Start, &interrupt).await }
        });

        interrupt.interrupt();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!verdict.is_finished());
        assert!(interrupt.is_interrupted());

        gate.notify_one();
        let verdict = tokio::time::timeout(Duration::from_secs(5), verdict)
            .await
            .expect("timed out")
            .unwrap();
        assert!(verdict);
    }

    #[tokio::test]
    async fn watched_outcome_is_written_once() {
        let service = healthy("one");

        let mut running = apply(service.as_ref(), Action::Start);
        assert_eq!(running.wait().await.unwrap(), State::Running);

        let mut terminated = apply(service.as_ref(), Action::Stop);
        assert_eq!(terminated.wait().await.unwrap(), State::Terminated);
        // The start outcome is unaffected by later transitions.
        assert_eq!(running.peek(), Some(State::Running));
    }
}
