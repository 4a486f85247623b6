// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use crate::guard::ApiResponse;

/// An access token whose structure cannot be decoded.
///
/// For freshness purposes this is treated the same as an expired token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedCredential {
    #[error("expected 3 token segments, found {0}")]
    Segments(usize),
    #[error("token segment is not base64url: {0}")]
    Encoding(String),
    #[error("token header is not a JSON object")]
    Header,
    #[error("token claims are invalid: {0}")]
    Claims(String),
}

/// Why a renewal exchange did not produce a new credential pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewError {
    #[error("no refresh token available")]
    NoRefreshToken,
    /// The request never got an answer (connection refused, reset, DNS).
    #[error("renewal request failed: {0}")]
    Network(String),
    #[error("renewal timed out after {0:?}")]
    Timeout(Duration),
    /// The server explicitly invalidated the refresh token.
    #[error("refresh token rejected: {0}")]
    Rejected(String),
    #[error("renewal endpoint returned HTTP {0}")]
    Status(u16),
    #[error("malformed renewal response: {0}")]
    MalformedResponse(String),
    #[error("failed to persist renewed credentials: {0}")]
    Persist(String),
    #[error("renewal was abandoned before it settled")]
    Aborted,
}

impl RenewError {
    /// Terminal failures clear the store and end the session. Transient ones
    /// leave the current credentials in place so the user can simply retry.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Network(_) | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRefreshToken => "NO_REFRESH_TOKEN",
            Self::Network(_) => "RENEWAL_NETWORK_ERROR",
            Self::Timeout(_) => "RENEWAL_TIMEOUT",
            Self::Rejected(_) => "RENEWAL_REJECTED",
            Self::Status(_) => "RENEWAL_STATUS",
            Self::MalformedResponse(_) => "RENEWAL_MALFORMED",
            Self::Persist(_) => "RENEWAL_PERSIST",
            Self::Aborted => "RENEWAL_ABORTED",
        }
    }
}

/// Failures surfaced by the outbound call guard.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    /// The call requires authentication and no credential pair exists.
    #[error("not signed in")]
    NotSignedIn,
    /// Teardown ran while the call was waiting on a renewal.
    #[error("session ended while the call was waiting for renewal")]
    SessionEnded,
    /// The server rejected the call and renewal could not recover it.
    #[error("authorization rejected (HTTP {})", .response.status)]
    Unauthorized { response: ApiResponse, renewal: Option<RenewError> },
    /// The call was rejected again after a successful renewal.
    #[error("call rejected after one retry (HTTP {})", .response.status)]
    RetryExhausted { response: ApiResponse },
    #[error("request failed: {0}")]
    Transport(String),
}

impl GuardError {
    /// Whether UI layers should treat this as an authentication problem.
    ///
    /// `RetryExhausted` is not one: the credential was just renewed, so
    /// sending the user through sign-in again would loop.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotSignedIn | Self::SessionEnded | Self::Unauthorized { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSignedIn => "NOT_SIGNED_IN",
            Self::SessionEnded => "SESSION_ENDED",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Transport(_) => "TRANSPORT",
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
