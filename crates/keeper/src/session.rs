// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The session service: one explicit handle owning the store, the renewal
//! timer, the coordinator, and the call guard.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::ActivityPinger;
use crate::clock::{Clock, SystemClock};
use crate::config::KeeperConfig;
use crate::credential::claims::{self, TokenStatus, Validator};
use crate::credential::slots::{CredentialSlots, CredentialSource, EnvSource, FileSlots};
use crate::credential::store::CredentialStore;
use crate::credential::CredentialPair;
use crate::error::GuardError;
use crate::events::SessionEvent;
use crate::guard::{ApiRequest, ApiResponse, CallGuard};
use crate::renew::RenewCoordinator;
use crate::scheduler::{spawn_renewal_driver, Scheduler};
use crate::sync::StorageWatcher;
use crate::teardown::Teardown;

/// Fallback poll for filesystems where change notification is unavailable.
const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of the session for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub signed_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_status: Option<TokenStatus>,
    /// Which backing location the pair was read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renews_in_secs: Option<u64>,
    pub has_refresh_token: bool,
    pub timer_armed: bool,
    pub renewing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<ClaimsSummary>,
}

/// Non-secret claim fields worth showing to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimsSummary {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

pub struct Session {
    clock: Arc<dyn Clock>,
    validator: Validator,
    store: Arc<CredentialStore>,
    scheduler: Arc<Scheduler>,
    coordinator: Arc<RenewCoordinator>,
    guard: CallGuard,
    teardown: Arc<Teardown>,
    activity: ActivityPinger,
    event_tx: broadcast::Sender<SessionEvent>,
    slot_dir: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl Session {
    /// Build a session persisting to the configured state directory, with
    /// the handoff directory (if any) and the environment as overrides.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &KeeperConfig) -> anyhow::Result<Arc<Self>> {
        let state_dir = config.state_dir();
        let mut overrides: Vec<Box<dyn CredentialSource>> = Vec::new();
        if let Some(ref dir) = config.handoff_dir {
            overrides.push(Box::new(FileSlots::handoff(dir)));
        }
        overrides.push(Box::new(EnvSource::default()));

        Self::with_parts(
            config,
            Arc::new(FileSlots::new(&state_dir)),
            overrides,
            Arc::new(SystemClock),
            Some(state_dir),
        )
    }

    /// Build a session from explicit parts. `slot_dir` enables
    /// [`Session::watch_storage`].
    pub fn with_parts(
        config: &KeeperConfig,
        local: Arc<dyn CredentialSlots>,
        overrides: Vec<Box<dyn CredentialSource>>,
        clock: Arc<dyn Clock>,
        slot_dir: Option<PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        crate::ensure_crypto_provider();
        let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;

        // Skew tolerance moves the stored renewal point earlier as well.
        let buffer_secs = config.buffer_secs.saturating_add(config.clock_skew_secs);
        let validator = Validator::new(config.buffer_secs).with_skew(config.clock_skew_secs);

        let (fire_tx, fired_rx) = mpsc::channel(8);
        let (event_tx, _) = broadcast::channel(64);
        let scheduler = Arc::new(Scheduler::new(fire_tx));
        let store = Arc::new(CredentialStore::new(
            local,
            overrides,
            Arc::clone(&scheduler),
            Arc::clone(&clock),
            buffer_secs,
        ));
        let teardown = Arc::new(Teardown::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            config.sign_in_url.clone(),
            event_tx.clone(),
        ));
        let coordinator = Arc::new(RenewCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&teardown),
            http.clone(),
            config.renew_url(),
            config.renew_timeout(),
            event_tx.clone(),
        ));
        let guard = CallGuard::new(
            http.clone(),
            config.api_url.clone(),
            validator,
            Arc::clone(&clock),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&teardown),
        );
        let activity =
            ActivityPinger::new(http, config.activity_url.clone(), Arc::clone(&store), Arc::clone(&clock));

        let shutdown = CancellationToken::new();
        spawn_renewal_driver(Arc::clone(&coordinator), fired_rx, shutdown.clone());

        if store.rearm() {
            info!(expires_at = ?store.read_expires_at(), "resumed persisted session");
        }

        Ok(Arc::new(Self {
            clock,
            validator,
            store,
            scheduler,
            coordinator,
            guard,
            teardown,
            activity,
            event_tx,
            slot_dir,
            shutdown,
        }))
    }

    /// Store a pair obtained from a sign-in flow. Returns the buffered
    /// `expires_at`.
    pub fn sign_in(&self, pair: CredentialPair, lifetime_secs: u64) -> anyhow::Result<u64> {
        if let Err(e) = claims::decode(&pair.access_token) {
            anyhow::bail!("refusing to store malformed access token: {e}");
        }
        let expires_at = self.store.write(&pair, lifetime_secs)?;
        self.teardown.reopen();
        info!(lifetime_secs, expires_at, "signed in");
        let _ = self.event_tx.send(SessionEvent::SignedIn { expires_at });
        Ok(expires_at)
    }

    /// End the session on request. Emits the sign-in redirect like any other
    /// teardown, then [`SessionEvent::SignedOut`].
    pub fn sign_out(&self) -> anyhow::Result<()> {
        if !self.teardown.run(None) {
            self.store.clear()?;
        }
        info!("signed out");
        let _ = self.event_tx.send(SessionEvent::SignedOut);
        Ok(())
    }

    /// Renew now. Returns whether a new pair was stored.
    pub async fn renew(&self) -> bool {
        self.coordinator.renew().await.is_ok()
    }

    pub async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, GuardError> {
        self.guard.call(request).await
    }

    pub fn status(&self) -> SessionStatus {
        let timer_armed = self.scheduler.is_armed();
        let renewing = self.coordinator.is_renewing();
        let Some(pair) = self.store.read() else {
            return SessionStatus {
                signed_in: false,
                token_status: None,
                source: None,
                expires_at: None,
                renews_in_secs: None,
                has_refresh_token: false,
                timer_armed,
                renewing,
                claims: None,
            };
        };

        let now = self.clock.now_secs();
        let decoded = self.validator.decode(&pair.access_token).ok();
        let token_status = match decoded {
            Some(ref c) => self.validator.classify(c, now),
            None => TokenStatus::Invalid,
        };
        SessionStatus {
            signed_in: true,
            token_status: Some(token_status),
            source: Some(pair.source),
            expires_at: pair.expires_at,
            renews_in_secs: pair.expires_at.map(|e| e.saturating_sub(now)),
            has_refresh_token: pair.refresh_token.is_some(),
            timer_armed,
            renewing,
            claims: decoded.map(|c| ClaimsSummary { sub: c.sub, role: c.role, exp: c.exp, sid: c.sid }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Follow changes other processes make to the slot directory. Returns
    /// `None` when the session has no slot directory to watch.
    pub fn watch_storage(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let dir = self.slot_dir.clone()?;
        let (change_tx, mut change_rx) = mpsc::channel(16);
        let watcher = StorageWatcher::new(dir).with_poll_interval(STORAGE_POLL_INTERVAL);
        tokio::spawn(watcher.run(change_tx, self.shutdown.clone()));

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    change = change_rx.recv() => match change {
                        Some(c) => c,
                        None => break,
                    },
                };
                // One resync covers the whole burst.
                while change_rx.try_recv().is_ok() {}
                debug!(path = %change.path.display(), "credential storage changed");
                this.resync();
            }
        }))
    }

    /// Re-read the store and bring the timer and teardown state in line with
    /// it. Returns whether a pair is present.
    pub fn resync(&self) -> bool {
        let signed_in = self.store.read().is_some();
        self.store.rearm();
        if signed_in {
            self.teardown.reopen();
        } else {
            self.teardown.interrupt();
        }
        info!(signed_in, "resynced with stored credentials");
        let _ = self.event_tx.send(SessionEvent::Resynced { signed_in });
        signed_in
    }

    /// Best-effort activity report. Never affects the session.
    pub fn ping(&self, action: &str) -> Option<JoinHandle<()>> {
        self.activity.ping(action)
    }

    pub fn renewal_exchanges(&self) -> u64 {
        self.coordinator.exchange_count()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Stop the timer and background tasks. Stored credentials are kept.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.disarm();
        debug!("session shut down");
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
