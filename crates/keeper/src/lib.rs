// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Keeper: session token lifecycle coordinator for API clients.
//!
//! Stores the current access/refresh credential pair, renews it ahead of
//! expiry, collapses concurrent renewals into one exchange, and guards every
//! outbound API call with a single authorization retry.

pub mod activity;
pub mod clock;
pub mod command;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod guard;
pub mod renew;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod teardown;
pub mod test_support;

#[cfg(test)]
mod test_http;

use std::sync::Once;

static CRYPTO_INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
