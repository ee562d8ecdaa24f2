//! Process exit hooks.
//!
//! A [`ShutdownHook`] holds a one-shot action, typically the reverse of a startup sequence.
//! Hooks are registered with the process-wide [`ExitHooks`], which runs them when the
//! process is asked to terminate. Whoever triggers a hook first runs it; anyone else
//! triggering it afterwards only waits for that first run to complete.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info};

struct HookInner {
    name: String,
    fired: AtomicBool,
    action: Mutex<Option<BoxFuture<'static, ()>>>,
    done: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownHook {
    inner: Arc<HookInner>,
}

impl fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("name", &self.inner.name)
            .field("fired", &self.has_fired())
            .finish()
    }
}

impl ShutdownHook {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(HookInner {
                name: name.into(),
                fired: AtomicBool::new(false),
                action: Mutex::new(Some(action.boxed())),
                done,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Runs the hook's action, once.
    ///
    /// Returns true if this call dispatched the action, false if it was already dispatched.
    /// Either way, returns once the action has completed. The action runs on its own task:
    /// dropping the returned future does not cancel it.
    pub async fn run(&self) -> bool {
        let first = !self.inner.fired.swap(true, Ordering::AcqRel);
        if first {
            let action = self
                .inner
                .action
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(action) = action {
                info!(hook = %self.inner.name, "running shutdown hook");
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::spawn(action).await {
                        error!(hook = %inner.name, "shutdown hook failed: {e}");
                    }
                    inner.done.send_replace(true);
                });
            }
        }

        let mut done = self.inner.done.subscribe();
        // `self` holds the sender, the channel cannot close while we wait.
        if done.wait_for(|done| *done).await.is_err() {
            error!(hook = %self.inner.name, "shutdown hook completion was lost");
        }
        first
    }

    fn same_as(&self, other: &ShutdownHook) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Registry of the hooks to run when the process exits.
#[derive(Clone, Default)]
pub struct ExitHooks {
    hooks: Arc<Mutex<Vec<ShutdownHook>>>,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: ShutdownHook) {
        self.lock().push(hook);
    }

    /// Removes `hook` from the registry. Returns false if it was not registered, which is
    /// the case once the exit hooks have been run.
    pub fn unregister(&self, hook: &ShutdownHook) -> bool {
        let mut hooks = self.lock();
        let before = hooks.len();
        hooks.retain(|registered| !registered.same_as(hook));
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered hook concurrently and waits for all of them. The registry is
    /// drained first, so each hook runs at most once through here.
    pub async fn run_all(&self) {
        let hooks: Vec<ShutdownHook> = self.lock().drain(..).collect();
        if hooks.is_empty() {
            return;
        }
        info!(hooks = hooks.len(), "running exit hooks");
        join_all(hooks.iter().map(|hook| hook.run())).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ShutdownHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    fn counting(name: &str, runs: Arc<AtomicUsize>, delay: Duration) -> ShutdownHook {
        ShutdownHook::new(name, async move {
            tokio::time::sleep(delay).await;
            runs.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_run_the_action_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hook = counting("once", runs.clone(), Duration::from_millis(50));

        let triggers: Vec<_> = (0..16)
            .map(|_| {
                let hook = hook.clone();
                tokio::spawn(async move { hook.run().await })
            })
            .collect();

        let mut dispatched = 0;
        for trigger in triggers {
            if trigger.await.unwrap() {
                dispatched += 1;
            }
            // Every trigger returns only after the action completed.
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
        assert_eq!(dispatched, 1);
        assert!(hook.has_fired());
    }

    #[tokio::test]
    async fn late_trigger_waits_for_the_first_run() {
        let gate = Arc::new(Notify::new());
        let hook = ShutdownHook::new("gated", {
            let gate = gate.clone();
            async move { gate.notified().await }
        });

        let first = tokio::spawn({
            let hook = hook.clone();
            async move { hook.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let hook = hook.clone();
            async move { hook.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        gate.notify_one();
        assert!(first.await.unwrap());
        assert!(!second.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_cancel_the_action() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hook = counting("detached", runs.clone(), Duration::from_millis(50));

        let waited = tokio::time::timeout(Duration::from_millis(5), hook.run()).await;
        assert!(waited.is_err());

        assert!(!hook.run().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_action_still_completes() {
        let hook = ShutdownHook::new("broken", async { panic!("boom") });
        let ran = tokio::time::timeout(Duration::from_secs(1), hook.run())
            .await
            .expect("timed out");
        assert!(ran);
    }

    #[tokio::test]
    async fn exit_hooks_run_each_registered_hook() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hooks = ExitHooks::new();
        let kept = counting("kept", runs.clone(), Duration::ZERO);
        let removed = counting("removed", runs.clone(), Duration::ZERO);
        hooks.register(kept.clone());
        hooks.register(removed.clone());
        hooks.register(counting("other", runs.clone(), Duration::ZERO));

        assert!(hooks.unregister(&removed));
        assert!(!hooks.unregister(&removed));
        assert_eq!(hooks.len(), 2);

        hooks.run_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(kept.has_fired());
        assert!(!removed.has_fired());

        // Drained: nothing left to unregister or run again.
        assert!(hooks.is_empty());
        assert!(!hooks.unregister(&kept));
        hooks.run_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
