//! Supervised polling loop with a start/stop handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::EngineResult;

use super::pause::Pause;

/// The work a loop repeats.
#[async_trait]
pub trait LoopBody: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs every time the loop (re)starts, before the first iteration.
    async fn on_start(&self) -> EngineResult<()> {
        Ok(())
    }

    /// One iteration. Returns `true` when it found work, which skips the
    /// idle pause.
    async fn iterate(&self) -> EngineResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLoopStatus {
    pub name: String,
    pub enabled: bool,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared {
    enabled: AtomicBool,
    // Bumped by every start; a loop task exits once it no longer owns the
    // current generation.
    generation: AtomicU64,
    modified_at: Mutex<DateTime<Utc>>,
    wake: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.enabled.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn touch(&self) {
        if let Ok(mut modified_at) = self.modified_at.lock() {
            *modified_at = Utc::now();
        }
    }
}

/// Control handle for one polling loop.
///
/// `start` spawns the loop on the current tokio runtime; starting a running
/// loop does nothing. `stop` is cooperative: the loop notices it at the next
/// iteration boundary (an idle pause is cut short).
pub struct EventLoop<B: LoopBody> {
    body: Arc<B>,
    min_pause: Duration,
    max_pause: Duration,
    shared: Arc<Shared>,
}

impl<B: LoopBody> EventLoop<B> {
    pub fn new(body: Arc<B>, min_pause: Duration, max_pause: Duration) -> Self {
        Self {
            body,
            min_pause,
            max_pause,
            shared: Arc::new(Shared {
                enabled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                modified_at: Mutex::new(Utc::now()),
                wake: Notify::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn body(&self) -> &Arc<B> {
        &self.body
    }

    /// Returns `false` if the loop was already running.
    pub fn start(&self) -> bool {
        if self.shared.enabled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.touch();

        let handle = tokio::spawn(supervise(
            Arc::clone(&self.body),
            Arc::clone(&self.shared),
            generation,
            self.min_pause,
            self.max_pause,
        ));
        if let Ok(mut slot) = self.shared.handle.lock() {
            *slot = Some(handle);
        }
        info!(event_loop = self.body.name(), "event loop started");
        true
    }

    /// Returns `false` if the loop was not running.
    pub fn stop(&self) -> bool {
        if !self.shared.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shared.touch();
        self.shared.wake.notify_one();
        info!(event_loop = self.body.name(), "event loop stopping");
        true
    }

    /// Wait for the most recently started loop task to exit.
    ///
    /// Returns `false` if the task panicked or was cancelled instead of
    /// returning.
    pub async fn join(&self) -> bool {
        let handle = self.shared.handle.lock().ok().and_then(|mut slot| slot.take());
        let Some(handle) = handle else {
            return true;
        };
        match handle.await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    event_loop = self.body.name(),
                    cancelled = err.is_cancelled(),
                    error = %err,
                    "event loop task ended abnormally"
                );
                false
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> EventLoopStatus {
        let modified_at = self
            .shared
            .modified_at
            .lock()
            .map(|at| *at)
            .unwrap_or_else(|_| Utc::now());
        EventLoopStatus {
            name: self.body.name().to_string(),
            enabled: self.is_enabled(),
            modified_at,
        }
    }
}

/// Keep the loop alive: a failed or panicked run is logged and restarted
/// until the loop is stopped.
async fn supervise<B: LoopBody>(
    body: Arc<B>,
    shared: Arc<Shared>,
    generation: u64,
    min_pause: Duration,
    max_pause: Duration,
) {
    let name = body.name();
    while shared.is_current(generation) {
        let run = tokio::spawn(run(
            Arc::clone(&body),
            Arc::clone(&shared),
            generation,
            min_pause,
            max_pause,
        ));
        match run.await {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                error!(event_loop = name, error = %err, "event loop iteration failed; restarting");
            }
            Err(err) => {
                error!(event_loop = name, error = %err, "event loop panicked; restarting");
            }
        }
        // Keep a persistently failing store from spinning the loop.
        tokio::time::sleep(min_pause).await;
    }
    info!(event_loop = name, "event loop stopped");
}

async fn run<B: LoopBody>(
    body: Arc<B>,
    shared: Arc<Shared>,
    generation: u64,
    min_pause: Duration,
    max_pause: Duration,
) -> EngineResult<()> {
    body.on_start().await?;
    let mut pause = Pause::new(min_pause, max_pause);
    while shared.is_current(generation) {
        if body.iterate().await? {
            pause.reset();
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(pause.next()) => {}
                _ = shared.wake.notified() => {}
            }
        }
    }
    Ok(())
}
