// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a keeper session.
#[derive(Debug, Clone, clap::Args)]
pub struct KeeperConfig {
    /// Base URL of the API that guarded calls go to.
    #[arg(long, env = "KEEPER_API_URL", default_value = "http://127.0.0.1:8080")]
    pub api_url: String,

    /// Renewal endpoint. Defaults to `<api-url>/auth/refresh`.
    #[arg(long, env = "KEEPER_RENEW_URL")]
    pub renew_url: Option<String>,

    /// Where to send the user when the session ends.
    #[arg(long, env = "KEEPER_SIGN_IN_URL", default_value = "http://127.0.0.1:8080/login")]
    pub sign_in_url: String,

    /// Directory holding the persisted credential pair.
    #[arg(long, env = "KEEPER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Directory whose credentials override the local ones until the next
    /// write (e.g. dropped there by a verification redirect handler).
    #[arg(long, env = "KEEPER_HANDOFF_DIR")]
    pub handoff_dir: Option<PathBuf>,

    /// Seconds before expiry at which a token is renewed.
    #[arg(long, env = "KEEPER_BUFFER_SECS", default_value_t = crate::credential::DEFAULT_BUFFER_SECS)]
    pub buffer_secs: u64,

    /// Seconds the local clock may lag the server. Widens the renewal window.
    #[arg(long, env = "KEEPER_CLOCK_SKEW_SECS", default_value_t = 0)]
    pub clock_skew_secs: u64,

    /// Renewal exchange timeout in milliseconds.
    #[arg(long, env = "KEEPER_RENEW_TIMEOUT_MS", default_value_t = 10_000)]
    pub renew_timeout_ms: u64,

    /// Per-request timeout for guarded API calls in milliseconds.
    #[arg(long, env = "KEEPER_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Optional endpoint for best-effort activity pings.
    #[arg(long, env = "KEEPER_ACTIVITY_URL")]
    pub activity_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "KEEPER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (json or text).
    #[arg(long, env = "KEEPER_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

impl KeeperConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_secs == 0 {
            anyhow::bail!("--buffer-secs must be greater than zero");
        }
        if self.renew_timeout_ms == 0 {
            anyhow::bail!("--renew-timeout-ms must be greater than zero");
        }

        let urls = [
            ("--api-url", Some(self.api_url.as_str())),
            ("--renew-url", self.renew_url.as_deref()),
            ("--sign-in-url", Some(self.sign_in_url.as_str())),
            ("--activity-url", self.activity_url.as_deref()),
        ];
        for (flag, url) in urls {
            let Some(url) = url else { continue };
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("{flag} is not a valid URL ({url}): {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("{flag} must be an http(s) URL, got {url}");
            }
        }

        match self.log_format.as_str() {
            "json" | "text" => Ok(()),
            other => anyhow::bail!("invalid --log-format: {other} (expected json or text)"),
        }
    }

    pub fn renew_url(&self) -> String {
        match self.renew_url {
            Some(ref url) => url.clone(),
            None => format!("{}/auth/refresh", self.api_url.trim_end_matches('/')),
        }
    }

    /// Resolved slot directory: flag/env, then `$XDG_STATE_HOME/keeper`, then
    /// `$HOME/.local/state/keeper`, then `.keeper` in the working directory.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(xdg).join("keeper");
        }
        if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(home).join(".local/state/keeper");
        }
        PathBuf::from(".keeper")
    }

    pub fn renew_timeout(&self) -> Duration {
        Duration::from_millis(self.renew_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Tracing directives for `--log-level`. A bare level applies to keeper
    /// itself with dependencies held at `warn`; full directives pass through.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_owned()
        } else {
            format!("warn,keeper={level}")
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
