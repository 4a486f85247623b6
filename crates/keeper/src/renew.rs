// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight renewal of the credential pair.
//!
//! The coordinator is either idle or running exactly one exchange. Callers
//! that arrive while an exchange is running subscribe to its outcome instead
//! of starting another. The exchange runs in its own task so it settles even
//! if every caller that was waiting on it goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::credential::claims;
use crate::credential::store::CredentialStore;
use crate::credential::CredentialPair;
use crate::error::RenewError;
use crate::events::SessionEvent;
use crate::teardown::Teardown;

type Outcome = Result<(), RenewError>;

enum RenewState {
    Idle,
    /// Receives `Some(outcome)` once the running exchange settles.
    Renewing(watch::Receiver<Option<Outcome>>),
}

#[derive(Serialize)]
struct RenewRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct RenewErrorBody {
    error: String,
    #[serde(default, alias = "message")]
    error_description: Option<String>,
}

/// A successfully parsed renewal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedPair {
    pub access_token: String,
    /// `None` when the server did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub lifetime_secs: u64,
}

/// Collapses concurrent renewal requests into one exchange with the renewal
/// endpoint and applies its outcome.
pub struct RenewCoordinator {
    store: Arc<CredentialStore>,
    teardown: Arc<Teardown>,
    http: reqwest::Client,
    renew_url: String,
    timeout: Duration,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Mutex<RenewState>,
    exchanges: AtomicU64,
}

impl RenewCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        teardown: Arc<Teardown>,
        http: reqwest::Client,
        renew_url: String,
        timeout: Duration,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            teardown,
            http,
            renew_url,
            timeout,
            event_tx,
            state: Mutex::new(RenewState::Idle),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Renew the credential pair, joining the in-flight exchange if there is
    /// one. Every caller of the same exchange sees the same outcome.
    pub async fn renew(self: &Arc<Self>) -> Result<(), RenewError> {
        let mut rx = self.join_or_start();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Err(RenewError::Aborted)),
            Err(_) => Err(RenewError::Aborted),
        };
        outcome
    }

    /// Number of exchanges sent to the renewal endpoint so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    pub fn is_renewing(&self) -> bool {
        matches!(&*self.state.lock(), RenewState::Renewing(rx) if rx.has_changed().is_ok())
    }

    fn join_or_start(self: &Arc<Self>) -> watch::Receiver<Option<Outcome>> {
        let mut state = self.state.lock();
        if let RenewState::Renewing(ref rx) = *state {
            // A closed channel means the exchange task died without settling.
            if rx.has_changed().is_ok() {
                debug!("joining in-flight renewal");
                return rx.clone();
            }
            warn!("previous renewal task vanished, starting a new one");
        }

        let (tx, rx) = watch::channel(None);
        *state = RenewState::Renewing(rx.clone());
        drop(state);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.exchange_and_apply().await;
            let mut state = this.state.lock();
            *state = RenewState::Idle;
            tx.send_replace(Some(outcome));
        });
        rx
    }

    async fn exchange_and_apply(&self) -> Outcome {
        let epoch = self.teardown.epoch();
        let result = match self.exchange().await {
            Ok(_) if epoch.is_cancelled() => {
                // Signed out while the exchange was in flight.
                debug!("session ended during renewal, discarding renewed pair");
                return Err(RenewError::Aborted);
            }
            Ok(renewed) => self.persist(renewed),
            Err(e) => Err(e),
        };

        match result {
            Ok(expires_at) => {
                info!(expires_at, "credentials renewed");
                let _ = self.event_tx.send(SessionEvent::Renewed { expires_at: Some(expires_at) });
                Ok(())
            }
            Err(e) => {
                let terminal = e.is_terminal();
                warn!(code = e.as_str(), terminal, err = %e, "renewal failed");
                let _ = self.event_tx.send(SessionEvent::RenewalFailed {
                    code: e.as_str().to_owned(),
                    error: e.to_string(),
                    terminal,
                });
                if terminal && !self.teardown.run(None) {
                    // Teardown already ran for this session; still drop the
                    // pair the failed exchange was based on.
                    if let Err(clear_err) = self.store.clear() {
                        warn!(err = %clear_err, "failed to clear credentials");
                    }
                }
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<RenewedPair, RenewError> {
        let refresh_token = self.store.read_refresh().ok_or(RenewError::NoRefreshToken)?;
        let seq = self.exchanges.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(seq, url = %self.renew_url, "sending renewal exchange");

        let send = async {
            let resp = self
                .http
                .post(&self.renew_url)
                .json(&RenewRequest { refresh_token: &refresh_token })
                .send()
                .await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => return Err(RenewError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(RenewError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(RenewError::Network(e.to_string())),
            Ok(Ok(r)) => r,
        };

        let mut renewed = parse_response(status, &body)?;
        renewed.refresh_token.get_or_insert(refresh_token);
        Ok(renewed)
    }

    fn persist(&self, renewed: RenewedPair) -> Result<u64, RenewError> {
        let pair = CredentialPair {
            access_token: renewed.access_token,
            refresh_token: renewed.refresh_token,
        };
        self.store.write(&pair, renewed.lifetime_secs).map_err(|e| RenewError::Persist(e.to_string()))
    }
}

/// Classify a renewal endpoint response.
pub fn parse_response(status: StatusCode, body: &[u8]) -> Result<RenewedPair, RenewError> {
    if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) {
        let reason = match serde_json::from_slice::<RenewErrorBody>(body) {
            Ok(err) => match err.error_description {
                Some(desc) => format!("{}: {desc}", err.error),
                None => err.error,
            },
            Err(_) => format!("HTTP {}", status.as_u16()),
        };
        return Err(RenewError::Rejected(reason));
    }
    if !status.is_success() {
        return Err(RenewError::Status(status.as_u16()));
    }

    let resp: RenewResponse =
        serde_json::from_slice(body).map_err(|e| RenewError::MalformedResponse(e.to_string()))?;
    if let Err(e) = claims::decode(&resp.access_token) {
        return Err(RenewError::MalformedResponse(format!("access token: {e}")));
    }
    let refresh_token = resp.refresh_token.filter(|t| !t.trim().is_empty());
    Ok(RenewedPair {
        access_token: resp.access_token,
        refresh_token,
        lifetime_secs: resp.expires_in,
    })
}

#[cfg(test)]
#[path = "renew_tests.rs"]
mod tests;
