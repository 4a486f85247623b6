// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `keeper` subcommands.

use clap::{Parser, Subcommand};

use crate::clock::epoch_secs;
use crate::config::KeeperConfig;
use crate::credential::claims;
use crate::credential::CredentialPair;
use crate::guard::ApiRequest;
use crate::session::{Session, SessionStatus};

#[derive(Parser)]
#[command(name = "keeper", version, about = "Session token lifecycle coordinator")]
pub struct Cli {
    #[command(flatten)]
    pub config: KeeperConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a credential pair obtained from a sign-in flow
    Login {
        /// Access token (compact JWT)
        #[arg(long, env = "KEEPER_LOGIN_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
        /// Refresh token used for renewal
        #[arg(long, env = "KEEPER_LOGIN_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,
        /// Server-declared lifetime in seconds (defaults to the token's exp)
        #[arg(long)]
        expires_in: Option<u64>,
    },
    /// Clear stored credentials
    Logout,
    /// Show the current session state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Renew the credential pair now
    Renew,
    /// Send a guarded API call and print the response body
    Call {
        /// HTTP method (GET, POST, ...)
        method: String,
        /// Path relative to the API URL
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Fail instead of sending anonymously when signed out
        #[arg(long)]
        require_auth: bool,
    },
    /// Keep the session fresh and print session events as JSON lines
    Watch,
}

pub async fn run(cli: Cli) -> i32 {
    let session = match Session::new(&cli.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e:#}");
            return 1;
        }
    };

    let code = match cli.command {
        Command::Login { access_token, refresh_token, expires_in } => {
            login(&session, access_token, refresh_token, expires_in)
        }
        Command::Logout => match session.sign_out() {
            Ok(()) => {
                println!("Signed out.");
                0
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        },
        Command::Status { json } => {
            let status = session.status();
            if json {
                match serde_json::to_string_pretty(&status) {
                    Ok(s) => println!("{s}"),
                    Err(e) => {
                        eprintln!("error: {e}");
                        return 1;
                    }
                }
            } else {
                print_status(&status);
            }
            if status.signed_in {
                0
            } else {
                1
            }
        }
        Command::Renew => {
            if !session.status().signed_in {
                eprintln!("error: not signed in");
                1
            } else if session.renew().await {
                println!("Renewed.");
                0
            } else {
                eprintln!("error: renewal failed");
                1
            }
        }
        Command::Call { method, path, body, require_auth } => {
            call(&session, &method, path, body, require_auth).await
        }
        Command::Watch => watch(&session).await,
    };

    session.shutdown();
    code
}

fn login(
    session: &Session,
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
) -> i32 {
    let lifetime = match expires_in {
        Some(secs) => secs,
        None => match claims::decode(&access_token) {
            Ok(c) => c.exp.saturating_sub(epoch_secs()),
            Err(e) => {
                eprintln!("error: invalid access token: {e}");
                return 1;
            }
        },
    };
    let pair = CredentialPair { access_token, refresh_token };
    match session.sign_in(pair, lifetime) {
        Ok(expires_at) => {
            println!("Signed in; renewal due at {expires_at} (in {}s).", expires_at.saturating_sub(epoch_secs()));
            0
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

async fn call(
    session: &Session,
    method: &str,
    path: String,
    body: Option<String>,
    require_auth: bool,
) -> i32 {
    let method = match reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            eprintln!("error: invalid method: {method}");
            return 2;
        }
    };
    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        match serde_json::from_str(&body) {
            Ok(value) => request.body = Some(value),
            Err(e) => {
                eprintln!("error: --body is not valid JSON: {e}");
                return 2;
            }
        }
    }
    if require_auth {
        request = request.requiring_auth();
    }

    match session.call(&request).await {
        Ok(resp) => {
            println!("{}", resp.text());
            if resp.is_success() {
                0
            } else {
                eprintln!("HTTP {}", resp.status);
                1
            }
        }
        Err(e) => {
            eprintln!("error [{}]: {e}", e.as_str());
            1
        }
    }
}

async fn watch(session: &std::sync::Arc<Session>) -> i32 {
    let mut events = session.subscribe();
    let _storage = session.watch_storage();
    eprintln!("Watching session (press Ctrl+C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return 0,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("warning: dropped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return 0,
            },
        }
    }
}

fn print_status(status: &SessionStatus) {
    let dash = "-".to_owned();
    let field = |v: Option<String>| v.unwrap_or_else(|| dash.clone());

    println!("{:<14}  {}", "SIGNED IN", if status.signed_in { "yes" } else { "no" });
    if !status.signed_in {
        return;
    }
    let token_status = status.token_status.and_then(|s| {
        serde_json::to_value(s).ok().and_then(|v| v.as_str().map(str::to_owned))
    });
    println!("{:<14}  {}", "TOKEN", field(token_status));
    println!("{:<14}  {}", "SOURCE", field(status.source.map(str::to_owned)));
    println!("{:<14}  {}", "SUBJECT", field(status.claims.as_ref().map(|c| c.sub.clone())));
    println!("{:<14}  {}", "ROLE", field(status.claims.as_ref().and_then(|c| c.role.clone())));
    println!("{:<14}  {}", "RENEWS IN", field(status.renews_in_secs.map(format_secs)));
    println!("{:<14}  {}", "REFRESH TOKEN", if status.has_refresh_token { "yes" } else { "no" });
    println!("{:<14}  {}", "TIMER", if status.timer_armed { "armed" } else { "idle" });
}

fn format_secs(s: u64) -> String {
    format!("{}m {:02}s", s / 60, s % 60)
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
