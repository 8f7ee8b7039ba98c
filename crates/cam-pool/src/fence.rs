//! Acquire/release fences.
//!
//! A fence is signalled once by the producer (hardware or a downstream consumer) and may be
//! awaited by any number of tasks. Pools attach deferred releases to unsignalled fences so a
//! buffer only becomes reusable after its last reader is done.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

type SignalCallback = Box<dyn FnOnce() + Send>;

struct FenceState {
    signalled: bool,
    callbacks: Vec<SignalCallback>,
}

struct FenceInner {
    state: Mutex<FenceState>,
    notify: Notify,
}

/// One-shot synchronization fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Creates an unsignalled fence.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(false)
    }

    /// Creates a fence that is already signalled.
    #[must_use]
    pub fn signalled() -> Self {
        Self::with_state(true)
    }

    fn with_state(signalled: bool) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState {
                    signalled,
                    callbacks: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Signals the fence, waking waiters and running queued releases. Signalling twice is a no-op.
    pub fn signal(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.signalled {
                return;
            }
            state.signalled = true;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.notify.notify_waiters();
        for callback in callbacks {
            callback();
        }
    }

    /// Whether the fence has been signalled.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.inner.state.lock().signalled
    }

    /// Waits until the fence is signalled.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_signalled() {
                return;
            }
            notified.await;
        }
    }

    /// Waits up to `timeout`. Returns `true` if the fence signalled in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Runs `callback` once the fence signals, immediately if it already has.
    pub(crate) fn on_signal(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if !state.signalled {
            state.callbacks.push(Box::new(callback));
            return;
        }
        drop(state);
        callback();
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("signalled", &self.is_signalled())
            .finish()
    }
}
