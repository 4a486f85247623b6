// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort activity pings.
//!
//! Pings report user activity to an optional endpoint. They never renew,
//! retry, or end the session: every failure is logged and dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::credential::store::CredentialStore;

#[derive(Debug, Serialize)]
struct ActivityPing<'a> {
    id: String,
    action: &'a str,
    at: u64,
}

/// Fire-and-forget reporter for an activity endpoint.
pub struct ActivityPinger {
    http: reqwest::Client,
    url: Option<String>,
    store: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl ActivityPinger {
    pub fn new(
        http: reqwest::Client,
        url: Option<String>,
        store: Arc<CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { http, url, store, clock }
    }

    /// Send a ping in the background. Returns `None` when no endpoint is
    /// configured.
    pub fn ping(&self, action: &str) -> Option<JoinHandle<()>> {
        let url = self.url.clone()?;
        let token = self.store.read_access();
        let body = serde_json::to_value(ActivityPing {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            at: self.clock.now_secs(),
        })
        .ok()?;
        let http = self.http.clone();

        Some(tokio::spawn(async move {
            let mut req = http.post(&url).json(&body);
            if let Some(ref token) = token {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => debug!("activity ping delivered"),
                Ok(resp) => debug!(status = resp.status().as_u16(), "activity ping rejected"),
                Err(e) => debug!(err = %e, "activity ping failed"),
            }
        }))
    }
}

#[cfg(test)]
#[path = "activity_tests.rs"]
mod tests;
