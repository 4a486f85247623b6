// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound call guard.
//!
//! Attaches the current access token to API calls, renews stale tokens before
//! sending, and recovers from a single authorization rejection by joining a
//! renewal and retrying once.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::credential::claims::{TokenStatus, Validator};
use crate::credential::store::CredentialStore;
use crate::error::{GuardError, RenewError};
use crate::renew::RenewCoordinator;
use crate::teardown::Teardown;

/// An API call, relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Fail with [`GuardError::NotSignedIn`] instead of sending anonymously.
    pub requires_auth: bool,
    /// Return path for the sign-in redirect. Defaults to `path`.
    pub destination: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: None, requires_auth: false, destination: None }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self { body: Some(body), ..Self::new(Method::POST, path) }
    }

    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Status and raw body of an API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED.as_u16()
    }
}

/// Wraps every outbound API call with credential handling.
pub struct CallGuard {
    http: reqwest::Client,
    api_url: String,
    validator: Validator,
    clock: Arc<dyn Clock>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RenewCoordinator>,
    teardown: Arc<Teardown>,
}

impl CallGuard {
    pub fn new(
        http: reqwest::Client,
        api_url: String,
        validator: Validator,
        clock: Arc<dyn Clock>,
        store: Arc<CredentialStore>,
        coordinator: Arc<RenewCoordinator>,
        teardown: Arc<Teardown>,
    ) -> Self {
        Self { http, api_url, validator, clock, store, coordinator, teardown }
    }

    /// Send `request`, renewing and retrying at most once on 401.
    ///
    /// Responses other than 401 are returned as-is, including failures.
    pub async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, GuardError> {
        let destination = request.destination.as_deref().unwrap_or(&request.path);
        self.teardown.note_destination(destination);
        let epoch = self.teardown.epoch();

        let token = self.prepare(request, destination, &epoch).await?;
        let response = self.send(request, token.as_deref()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }
        if token.is_none() || epoch.is_cancelled() {
            return Err(GuardError::Unauthorized { response, renewal: None });
        }

        let retry_token = match self.store.read_access() {
            // Another call already renewed while this one was in flight.
            Some(current) if token.as_deref() != Some(current.as_str()) => {
                debug!(path = %request.path, "call rejected with a replaced token, retrying once");
                current
            }
            _ => {
                info!(path = %request.path, "call rejected, renewing and retrying once");
                if let Err(e) = self.renew_or_end(&epoch).await? {
                    return Err(GuardError::Unauthorized { response, renewal: Some(e) });
                }
                self.store.read_access().ok_or(GuardError::SessionEnded)?
            }
        };

        let retried = self.send(request, Some(&retry_token)).await?;
        if retried.is_unauthorized() {
            warn!(path = %request.path, "call rejected again after renewal");
            return Err(GuardError::RetryExhausted { response: retried });
        }
        Ok(retried)
    }

    /// Pick the token to attach, renewing first if the current one is stale.
    async fn prepare(
        &self,
        request: &ApiRequest,
        destination: &str,
        epoch: &CancellationToken,
    ) -> Result<Option<String>, GuardError> {
        let Some(pair) = self.store.read() else {
            return self.signed_out(request, destination);
        };

        let status = self.validator.status(&pair.access_token, self.clock.now_secs());
        match status {
            TokenStatus::Valid => Ok(Some(pair.access_token)),
            _ if pair.refresh_token.is_some() => {
                debug!(?status, "access token stale, renewing before call");
                if let Err(e) = self.renew_or_end(epoch).await? {
                    debug!(code = e.as_str(), "pre-call renewal failed");
                }
                // Whatever the store holds now, renewed or not.
                match self.store.read_access() {
                    Some(token) => Ok(Some(token)),
                    None if request.requires_auth => Err(GuardError::SessionEnded),
                    None => Ok(None),
                }
            }
            // Still accepted by the server, and nothing to renew it with.
            TokenStatus::ExpiredSoon => Ok(Some(pair.access_token)),
            TokenStatus::Expired | TokenStatus::Invalid => {
                debug!(?status, "unusable access token without refresh token");
                self.signed_out(request, destination)
            }
        }
    }

    fn signed_out(
        &self,
        request: &ApiRequest,
        destination: &str,
    ) -> Result<Option<String>, GuardError> {
        if request.requires_auth {
            self.teardown.run(Some(destination));
            return Err(GuardError::NotSignedIn);
        }
        Ok(None)
    }

    /// Join a renewal, giving up if the session ends while waiting.
    async fn renew_or_end(
        &self,
        epoch: &CancellationToken,
    ) -> Result<Result<(), RenewError>, GuardError> {
        tokio::select! {
            biased;
            outcome = self.coordinator.renew() => Ok(outcome),
            _ = epoch.cancelled() => Err(GuardError::SessionEnded),
        }
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, GuardError> {
        let url = format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        let mut builder = self.http.request(request.method.clone(), &url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| GuardError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| GuardError::Transport(e.to_string()))?;
        debug!(method = %request.method, path = %request.path, status, "api call completed");
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
#[path = "guard_tests.rs"]
mod tests;
