// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::Serialize;

/// Events broadcast by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A sign-in flow stored a new pair.
    SignedIn { expires_at: u64 },
    /// A renewal exchange stored a new pair.
    Renewed { expires_at: Option<u64> },
    /// A renewal exchange failed. Terminal failures are followed by
    /// [`SessionEvent::SignInRequired`].
    RenewalFailed { code: String, error: String, terminal: bool },
    /// The session ended; navigate to `redirect`.
    SignInRequired { redirect: String },
    /// Explicit sign-out.
    SignedOut,
    /// Another process changed the stored credentials and this one reloaded.
    Resynced { signed_in: bool },
}
