//! State-change notifications.
//!
//! The processing service is handed a [`StateNotifier`] when it is built and
//! calls it synchronously after every committed state mutation. There is no
//! process-global bus: whoever wires the engine decides who listens.

pub mod broadcast;
pub mod change;
pub mod notifier;

pub use broadcast::BroadcastNotifier;
pub use change::StateChanged;
pub use notifier::{NoopNotifier, StateNotifier, Subscription};
