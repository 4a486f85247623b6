// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: token minting, config builders, and assertion helpers.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::config::KeeperConfig;

/// Mint an unsigned compact token carrying `claims` as its payload.
pub fn mint_token_with(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// Mint a token for `sub` valid from `iat` until `exp`, with a unique `jti`.
pub fn mint_token(sub: &str, iat: u64, exp: u64) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let jti = format!("jti-{}", SEQ.fetch_add(1, Ordering::Relaxed));
    mint_token_with(&serde_json::json!({
        "sub": sub,
        "role": "member",
        "permissions": ["read"],
        "iat": iat,
        "exp": exp,
        "iss": "https://api.example.test",
        "aud": "keeper-tests",
        "jti": jti,
    }))
}

/// Config pointing at the given API and renewal endpoints with short timeouts.
pub fn test_config(api_url: &str, renew_url: &str) -> KeeperConfig {
    KeeperConfig {
        api_url: api_url.to_owned(),
        renew_url: Some(renew_url.to_owned()),
        sign_in_url: "https://app.example.test/login".to_owned(),
        state_dir: None,
        handoff_dir: None,
        buffer_secs: 300,
        clock_skew_secs: 0,
        renew_timeout_ms: 2000,
        request_timeout_ms: 5000,
        activity_url: None,
        log_level: "debug".to_owned(),
        log_format: "text".to_owned(),
    }
}

#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
