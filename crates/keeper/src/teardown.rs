// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal cleanup when a session cannot continue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::store::CredentialStore;
use crate::events::SessionEvent;
use crate::scheduler::Scheduler;

/// Clears credentials, stops the timer, interrupts queued retries, and emits
/// the sign-in redirect. Runs at most once per signed-in session.
pub struct Teardown {
    store: Arc<CredentialStore>,
    scheduler: Arc<Scheduler>,
    sign_in_url: String,
    event_tx: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    /// Cancelled on teardown; guarded calls waiting on a renewal watch it.
    epoch: Mutex<CancellationToken>,
    /// Destination of the most recent guarded call, used as the return path
    /// when teardown is triggered without one (e.g. by the proactive timer).
    destination: Mutex<Option<String>>,
}

impl Teardown {
    pub fn new(
        store: Arc<CredentialStore>,
        scheduler: Arc<Scheduler>,
        sign_in_url: String,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            scheduler,
            sign_in_url,
            event_tx,
            closed: AtomicBool::new(false),
            epoch: Mutex::new(CancellationToken::new()),
            destination: Mutex::new(None),
        }
    }

    /// End the session. Returns `false` if it had already ended.
    pub fn run(&self, return_to: Option<&str>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("teardown already ran");
            return false;
        }

        self.scheduler.disarm();
        if let Err(e) = self.store.clear() {
            warn!(err = %e, "failed to clear credentials during teardown");
        }
        self.epoch.lock().cancel();

        let destination = match return_to {
            Some(d) => Some(d.to_owned()),
            None => self.destination.lock().clone(),
        };
        let redirect = sign_in_redirect(&self.sign_in_url, destination.as_deref());
        info!(%redirect, "session ended, sign-in required");
        let _ = self.event_tx.send(SessionEvent::SignInRequired { redirect });
        true
    }

    /// Stop in-process work after another process ended the session. The
    /// store is left alone and no redirect is emitted here. The session stays
    /// open for teardown, so the next protected call still redirects.
    pub fn interrupt(&self) {
        self.scheduler.disarm();
        self.epoch.lock().cancel();
        debug!("session interrupted by external change");
    }

    /// Re-open after a new sign-in so the next failure tears down again.
    pub fn reopen(&self) {
        let mut epoch = self.epoch.lock();
        if epoch.is_cancelled() {
            *epoch = CancellationToken::new();
        }
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the current session ends.
    pub fn epoch(&self) -> CancellationToken {
        self.epoch.lock().clone()
    }

    pub fn note_destination(&self, destination: &str) {
        *self.destination.lock() = Some(destination.to_owned());
    }
}

/// Build the sign-in URL with `return_to` carrying the original destination.
pub fn sign_in_redirect(sign_in_url: &str, return_to: Option<&str>) -> String {
    let Some(return_to) = return_to else {
        return sign_in_url.to_owned();
    };
    match reqwest::Url::parse(sign_in_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("return_to", return_to);
            url.to_string()
        }
        Err(_) => sign_in_url.to_owned(),
    }
}

#[cfg(test)]
#[path = "teardown_tests.rs"]
mod tests;
