// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access-token claim decoding and freshness classification.
//!
//! Signatures are not verified here: the server does that on every call.
//! The client only needs the declared expiry to decide when to renew.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::credential::{renewal_lead, DEFAULT_BUFFER_SECS};
use crate::error::MalformedCredential;

/// Claims embedded in an access token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user) id. Numeric ids are normalized to strings.
    #[serde(deserialize_with = "string_or_number")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "sessionId")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "deviceId")]
    pub device_id: Option<String>,
    /// Set by the server on tokens minted through a verified renewal.
    #[serde(default, alias = "refreshVerified")]
    pub refresh_verified: bool,
}

/// `aud` may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Self::One(a) => a == aud,
            Self::Many(list) => list.iter().any(|a| a == aud),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

/// Freshness of an access token at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Usable and outside the renewal window.
    Valid,
    /// Still accepted by the server but inside the renewal window.
    ExpiredSoon,
    Expired,
    /// Cannot be decoded.
    Invalid,
}

impl TokenStatus {
    pub fn needs_renewal(&self) -> bool {
        !matches!(self, Self::Valid)
    }
}

/// Decode the claims of a compact `header.payload.signature` token.
pub fn decode(token: &str) -> Result<Claims, MalformedCredential> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(MalformedCredential::Segments(segments.len()));
    }

    let header = decode_segment(segments[0])?;
    match serde_json::from_slice::<serde_json::Value>(&header) {
        Ok(serde_json::Value::Object(_)) => {}
        _ => return Err(MalformedCredential::Header),
    }

    let payload = decode_segment(segments[1])?;
    serde_json::from_slice(&payload).map_err(|e| MalformedCredential::Claims(e.to_string()))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, MalformedCredential> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| MalformedCredential::Encoding(e.to_string()))
}

/// Classifies tokens against the renewal window.
///
/// Compares the token's own `exp` claim, not the store's buffered
/// `expires_at`, so it stays correct for tokens written by other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validator {
    buffer_secs: u64,
    skew_secs: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SECS)
    }
}

impl Validator {
    pub fn new(buffer_secs: u64) -> Self {
        Self { buffer_secs, skew_secs: 0 }
    }

    /// Assume the local clock may lag the server by up to `skew_secs`.
    pub fn with_skew(mut self, skew_secs: u64) -> Self {
        self.skew_secs = skew_secs;
        self
    }

    pub fn decode(&self, token: &str) -> Result<Claims, MalformedCredential> {
        decode(token)
    }

    pub fn status(&self, token: &str, now: u64) -> TokenStatus {
        match decode(token) {
            Ok(claims) => self.classify(&claims, now),
            Err(_) => TokenStatus::Invalid,
        }
    }

    pub fn classify(&self, claims: &Claims, now: u64) -> TokenStatus {
        let now = now.saturating_add(self.skew_secs);
        if now >= claims.exp {
            TokenStatus::Expired
        } else if now >= claims.exp.saturating_sub(self.buffer_for(claims)) {
            TokenStatus::ExpiredSoon
        } else {
            TokenStatus::Valid
        }
    }

    /// Epoch second at which a token enters the renewal window.
    pub fn renew_at(&self, claims: &Claims) -> u64 {
        claims.exp.saturating_sub(self.buffer_for(claims)).saturating_sub(self.skew_secs)
    }

    /// The buffer, capped at half the token's lifetime when `iat` is known.
    fn buffer_for(&self, claims: &Claims) -> u64 {
        if claims.iat == 0 || claims.iat >= claims.exp {
            return self.buffer_secs;
        }
        renewal_lead(claims.exp - claims.iat, self.buffer_secs)
    }
}

#[cfg(test)]
#[path = "claims_tests.rs"]
mod tests;
