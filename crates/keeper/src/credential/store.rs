// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The credential store: sole owner of the current pair.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::credential::claims;
use crate::credential::slots::{CredentialSlots, CredentialSource, SlotRecord};
use crate::credential::{renewal_lead, CredentialPair};
use crate::scheduler::Scheduler;

/// A pair as currently persisted, plus where it was found.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct StoredPair {
    #[serde(skip)]
    pub access_token: String,
    #[serde(skip)]
    pub refresh_token: Option<String>,
    /// Epoch second at which renewal is due (already buffered).
    pub expires_at: Option<u64>,
    pub source: &'static str,
}

impl std::fmt::Debug for StoredPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredPair")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

/// Persists the current credential pair and keeps the renewal timer in step
/// with it.
pub struct CredentialStore {
    overrides: Vec<Box<dyn CredentialSource>>,
    local: Arc<dyn CredentialSlots>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    buffer_secs: u64,
    /// Writers take this exclusively so in-process readers never see a mix
    /// of two pairs.
    gate: RwLock<()>,
}

impl CredentialStore {
    pub fn new(
        local: Arc<dyn CredentialSlots>,
        overrides: Vec<Box<dyn CredentialSource>>,
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
        buffer_secs: u64,
    ) -> Self {
        Self { overrides, local, scheduler, clock, buffer_secs, gate: RwLock::new(()) }
    }

    /// Persist `pair` as the current credentials and re-arm the renewal timer.
    ///
    /// The whole record is replaced in one write. Returns the buffered
    /// `expires_at`: the buffer ahead of expiry, or halfway through a
    /// lifetime shorter than twice the buffer, and at least one second out.
    pub fn write(&self, pair: &CredentialPair, lifetime_secs: u64) -> anyhow::Result<u64> {
        let now = self.clock.now_secs();
        let due_in = (lifetime_secs - renewal_lead(lifetime_secs, self.buffer_secs)).max(1);
        let expires_at = now + due_in;

        let record = SlotRecord {
            access_token: Some(pair.access_token.clone()),
            refresh_token: pair.refresh_token.clone(),
            expires_at: Some(expires_at),
        };
        {
            let _gate = self.gate.write();
            for source in &self.overrides {
                source.discard();
            }
            self.local.save(&record)?;
        }

        debug!(lifetime_secs, expires_at, "credentials written");
        self.scheduler.arm(Duration::from_secs(expires_at.saturating_sub(now)));
        Ok(expires_at)
    }

    /// Read the current pair, checking override sources before local slots.
    ///
    /// Both tokens come from the same location. A refresh token without an
    /// access token (an interrupted write or clear) reads as absent.
    pub fn read(&self) -> Option<StoredPair> {
        let _gate = self.gate.read();
        for source in &self.overrides {
            if let Some(pair) = self.read_from(&**source) {
                return Some(pair);
            }
        }
        self.read_from(&*self.local)
    }

    fn read_from<S: CredentialSource + ?Sized>(&self, source: &S) -> Option<StoredPair> {
        let record = source.load();
        let access_token = record.access_token?;
        let expires_at = record.expires_at.or_else(|| self.derived_expiry(&access_token));
        Some(StoredPair {
            access_token,
            refresh_token: record.refresh_token,
            expires_at,
            source: source.name(),
        })
    }

    pub fn read_access(&self) -> Option<String> {
        self.read().map(|p| p.access_token)
    }

    pub fn read_refresh(&self) -> Option<String> {
        self.read().and_then(|p| p.refresh_token)
    }

    pub fn read_expires_at(&self) -> Option<u64> {
        self.read().and_then(|p| p.expires_at)
    }

    /// Remove all persisted credential material and disarm the timer.
    pub fn clear(&self) -> anyhow::Result<()> {
        let result = {
            let _gate = self.gate.write();
            for source in &self.overrides {
                source.discard();
            }
            self.local.save(&SlotRecord::default())
        };
        self.scheduler.disarm();
        match result {
            Ok(()) => {
                info!("credentials cleared");
                Ok(())
            }
            Err(e) => {
                warn!(err = %e, "failed to clear credentials");
                Err(e)
            }
        }
    }

    /// Re-arm the timer from whatever is persisted now. Used at startup and
    /// after another process changed the store.
    pub fn rearm(&self) -> bool {
        match self.read().and_then(|p| p.expires_at) {
            Some(expires_at) => {
                let delay = expires_at.saturating_sub(self.clock.now_secs());
                self.scheduler.arm(Duration::from_secs(delay));
                true
            }
            None => {
                self.scheduler.disarm();
                false
            }
        }
    }

    fn derived_expiry(&self, access_token: &str) -> Option<u64> {
        let claims = claims::decode(access_token).ok()?;
        let lead = if claims.iat == 0 {
            self.buffer_secs
        } else {
            renewal_lead(claims.exp.saturating_sub(claims.iat), self.buffer_secs)
        };
        Some(claims.exp.saturating_sub(lead))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
