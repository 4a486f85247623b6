// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proactive renewal timer.
//!
//! Exactly one timer exists at a time. When it fires it sends a [`Fired`]
//! message; [`spawn_renewal_driver`] turns those messages into calls to the
//! renewal coordinator. The scheduler never looks at renewal outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::renew::RenewCoordinator;

/// A timer expiry. `generation` identifies which `arm()` call produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub generation: u64,
}

struct Armed {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Single-slot renewal timer.
pub struct Scheduler {
    timer: Arc<Mutex<Option<Armed>>>,
    generation: AtomicU64,
    fire_tx: mpsc::Sender<Fired>,
}

impl Scheduler {
    pub fn new(fire_tx: mpsc::Sender<Fired>) -> Self {
        Self { timer: Arc::new(Mutex::new(None)), generation: AtomicU64::new(0), fire_tx }
    }

    /// (Re)arm the timer to fire after `delay`. Any previously armed timer is
    /// cancelled first. A zero delay fires on the next tick.
    pub fn arm(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Nothing would drive the timer; the next session start re-arms.
            warn!("no async runtime, renewal timer not armed");
            return;
        };

        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = Instant::now() + delay;
        let slot = Arc::clone(&self.timer);
        let fire_tx = self.fire_tx.clone();

        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut current = slot.lock();
                match current.as_ref() {
                    Some(armed) if armed.generation == generation => {
                        // Disown the handle: re-arming from inside the renewal
                        // must not abort this task.
                        current.take();
                    }
                    _ => return,
                }
            }
            debug!(generation, "renewal timer fired");
            if fire_tx.try_send(Fired { generation }).is_err() {
                debug!(generation, "renewal already queued, dropping timer fire");
            }
        });

        debug!(generation, delay_secs = delay.as_secs(), "renewal timer armed");
        *timer = Some(Armed { generation, deadline, handle });
    }

    /// Cancel the pending timer, if any.
    pub fn disarm(&self) {
        if let Some(armed) = self.timer.lock().take() {
            armed.handle.abort();
            debug!(generation = armed.generation, "renewal timer disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.lock().as_ref().map(|a| a.deadline)
    }

    /// Time left until the armed timer fires.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Forward timer fires to the coordinator until `shutdown` is cancelled.
pub fn spawn_renewal_driver(
    coordinator: Arc<RenewCoordinator>,
    mut fired_rx: mpsc::Receiver<Fired>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let fired = tokio::select! {
                _ = shutdown.cancelled() => break,
                fired = fired_rx.recv() => match fired {
                    Some(f) => f,
                    None => break,
                },
            };
            info!(generation = fired.generation, "proactive renewal starting");
            // Outcome handling belongs to the coordinator.
            let _ = coordinator.renew().await;
        }
        debug!("renewal driver stopped");
    })
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
