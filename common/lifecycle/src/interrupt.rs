use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide interrupt requests.
///
/// Every call to [`Interrupt::interrupt`] raises a new request. Waiters that observe one
/// record it and keep going: an interrupt never cancels service operations that were already
/// issued. A wait can either react to any request, past or future ([`Interrupt::interrupted`]),
/// or only to requests raised after it began ([`Interrupt::subsequent`]).
#[derive(Clone, Debug)]
pub struct Interrupt {
    raised: Arc<watch::Sender<u64>>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (raised, _) = watch::channel(0);
        Self {
            raised: Arc::new(raised),
        }
    }

    pub fn interrupt(&self) {
        self.raised.send_modify(|count| *count += 1);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.raised.borrow() > 0
    }

    /// Resolves once any interrupt has been raised, immediately if one already was.
    pub async fn interrupted(&self) {
        self.raised_after(0).await
    }

    /// Resolves on the first interrupt raised after this call.
    ///
    /// The current count is read when `subsequent` is called, not when the future is first
    /// polled.
    pub fn subsequent(&self) -> impl Future<Output = ()> + Send + 'static {
        let seen = *self.raised.borrow();
        self.raised_after(seen)
    }

    fn raised_after(&self, seen: u64) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.raised.subscribe();
        async move {
            if receiver.wait_for(|count| *count > seen).await.is_err() {
                // Every handle is gone, nothing can raise another request.
                std::future::pending::<()>().await;
            }
        }
    }
}
