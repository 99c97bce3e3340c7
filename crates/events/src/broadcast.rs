//! In-process fan-out notifier.

use std::sync::{Mutex, mpsc};

use tracing::warn;

use crate::change::StateChanged;
use crate::notifier::{StateNotifier, Subscription};

/// Sends a copy of each state change to every open [`Subscription`].
///
/// Delivery is synchronous and never blocks the notifying engine call. A
/// subscription whose receiver was dropped is forgotten the next time a
/// change is sent.
#[derive(Debug, Default)]
pub struct BroadcastNotifier {
    subscribers: Mutex<Vec<mpsc::Sender<StateChanged>>>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<StateChanged> {
        let (tx, rx) = mpsc::channel();

        // With a poisoned list the subscription stays silent.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl StateNotifier for BroadcastNotifier {
    fn notify(&self, change: &StateChanged) {
        match self.subscribers.lock() {
            // A failed send means the receiver is gone.
            Ok(mut subs) => subs.retain(|tx| tx.send(change.clone()).is_ok()),
            Err(_) => warn!(job_id = %change.job_id(), "notifier lock poisoned; change dropped"),
        }
    }
}
