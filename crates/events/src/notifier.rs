//! Notification seam between the engine and its observers.
//!
//! A [`StateNotifier`] is the explicit callback the processing service fires
//! after each committed mutation. Implementations must not block for long:
//! they run on the worker that performed the mutation.
//!
//! ```ignore
//! let notifier = Arc::new(BroadcastNotifier::new());
//! let subscription = notifier.subscribe();
//! let service = TaskProcessingService::new(store, registry, notifier.clone());
//!
//! while let Ok(change) = subscription.recv_timeout(Duration::from_secs(1)) {
//!     println!("{} -> {}", change.job_id(), change.state());
//! }
//! ```

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::change::StateChanged;

/// Receiving end of a [`crate::BroadcastNotifier`].
///
/// Owned by one consumer thread. It sees every change sent after it was
/// created, in the order the notifier sent them.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next change. Errors once the notifier is gone.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Next queued change, if any.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Like `recv`, giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Callback invoked synchronously after every committed state mutation.
pub trait StateNotifier: Send + Sync {
    fn notify(&self, change: &StateChanged);
}

impl<N> StateNotifier for Arc<N>
where
    N: StateNotifier + ?Sized,
{
    fn notify(&self, change: &StateChanged) {
        (**self).notify(change)
    }
}

/// Plain closures are notifiers.
impl<F> StateNotifier for F
where
    F: Fn(&StateChanged) + Send + Sync,
{
    fn notify(&self, change: &StateChanged) {
        self(change)
    }
}

/// Notifier that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl StateNotifier for NoopNotifier {
    fn notify(&self, _change: &StateChanged) {}
}
