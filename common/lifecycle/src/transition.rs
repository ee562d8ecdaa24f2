//! One-shot transition outcomes.
//!
//! A [`TransitionPromise`] is the write side of a single outcome slot: the first
//! [`complete`](TransitionPromise::complete) wins and every later attempt is rejected.
//! Any number of [`TransitionFuture`] clones can wait on the slot.

use tokio::sync::watch;

use crate::error::LifecycleError;
use crate::service::State;

/// Creates a linked promise/future pair for `identity` reaching `expected`.
pub fn transition(identity: &str, expected: State) -> (TransitionPromise, TransitionFuture) {
    let (sender, receiver) = watch::channel(None);
    let promise = TransitionPromise { sender };
    let future = TransitionFuture {
        identity: identity.to_owned(),
        expected,
        receiver,
    };
    (promise, future)
}

#[derive(Debug)]
pub struct TransitionPromise {
    sender: watch::Sender<Option<State>>,
}

impl TransitionPromise {
    /// Writes the outcome. Returns false, leaving the first outcome in place, if the
    /// slot was already written.
    pub fn complete(&self, state: State) -> bool {
        self.sender.send_if_modified(|slot| match slot {
            Some(_) => false,
            None => {
                *slot = Some(state);
                true
            }
        })
    }

    pub fn is_completed(&self) -> bool {
        self.sender.borrow().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TransitionFuture {
    identity: String,
    expected: State,
    receiver: watch::Receiver<Option<State>>,
}

impl TransitionFuture {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn expected(&self) -> State {
        self.expected
    }

    /// The outcome, if already written.
    pub fn peek(&self) -> Option<State> {
        *self.receiver.borrow()
    }

    /// Waits for the outcome. Fails with [`LifecycleError::Abandoned`] if the promise is
    /// dropped without being completed.
    pub async fn wait(&mut self) -> Result<State, LifecycleError> {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(outcome) => Ok((*outcome).unwrap_or(State::Failed)),
            Err(_) => Err(LifecycleError::Abandoned {
                identity: self.identity.clone(),
                expected: self.expected,
            }),
        }
    }
}
