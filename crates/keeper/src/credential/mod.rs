// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential pair model, claim validation, and persistence.
//!
//! The store is the only owner of the current pair. Everything else reads it
//! on demand so that nobody acts on a stale private copy.

pub mod claims;
pub mod slots;
pub mod store;

use serde::{Deserialize, Serialize};

/// Default margin subtracted from the server-declared lifetime (5 minutes).
pub const DEFAULT_BUFFER_SECS: u64 = 300;

/// How long before expiry a token living `lifetime_secs` becomes due for
/// renewal: the buffer, capped at half the lifetime so a token shorter than
/// the buffer is not renewed the moment it arrives.
pub fn renewal_lead(lifetime_secs: u64, buffer_secs: u64) -> u64 {
    buffer_secs.min(lifetime_secs / 2)
}

/// An access token plus the refresh token used to renew it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token: Some(refresh_token.into()) }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Persisted key names. These are the field names of the slot record on
/// disk, so they are a wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    ExpiresAt,
}

impl CredentialKey {
    /// Every key, access token first.
    pub const ALL: [CredentialKey; 3] = [Self::AccessToken, Self::RefreshToken, Self::ExpiresAt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::ExpiresAt => "expires_at",
        }
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
