// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local axum servers standing in for the renewal endpoint and the API.
//!
//! Shared by unit tests and the integration tests under `tests/`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Canned renewal endpoint. Response `i` answers call `i`; once the list runs
/// out the last response repeats.
pub struct MockRenewServer {
    pub url: String,
    pub calls: Arc<AtomicU32>,
    /// Request bodies received, in arrival order.
    pub requests: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockRenewServer {
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub async fn mock_renew_server(responses: Vec<(u16, String)>, delay: Duration) -> MockRenewServer {
    let calls = Arc::new(AtomicU32::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(responses);

    let app = {
        let calls = Arc::clone(&calls);
        let requests = Arc::clone(&requests);
        Router::new().route(
            "/auth/refresh",
            post(move |body: String| {
                let calls = Arc::clone(&calls);
                let requests = Arc::clone(&requests);
                let responses = Arc::clone(&responses);
                async move {
                    let idx = calls.fetch_add(1, Ordering::SeqCst) as usize;
                    requests
                        .lock()
                        .push(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null));
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let (status, body) = responses
                        .get(idx)
                        .or(responses.last())
                        .cloned()
                        .unwrap_or((500, "{}".to_owned()));
                    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), body)
                }
            }),
        )
    };

    let addr = serve(app).await;
    MockRenewServer { url: format!("http://{addr}/auth/refresh"), calls, requests }
}

/// JSON body of a successful renewal response.
pub fn renew_body(access_token: &str, refresh_token: Option<&str>, expires_in: u64) -> String {
    let mut body = serde_json::json!({
        "access_token": access_token,
        "expires_in": expires_in,
    });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = serde_json::Value::String(refresh.to_owned());
    }
    body.to_string()
}

/// Mock API that accepts bearer tokens from an allow-list.
///
/// - `/public/*` answers 200 without looking at credentials.
/// - `/broken/*` answers 500.
/// - Everything else answers 200 for an accepted token, 401 otherwise.
pub struct MockApiServer {
    pub url: String,
    accepted: Arc<Mutex<HashSet<String>>>,
    /// `Authorization` header of every request, in arrival order.
    pub seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockApiServer {
    pub fn accept(&self, token: &str) {
        self.accepted.lock().insert(token.to_owned());
    }

    pub fn revoke_all(&self) {
        self.accepted.lock().clear();
    }

    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().len()
    }
}

/// How long `/slow/...` requests wait before the token is checked.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(300);

pub async fn mock_api_server() -> MockApiServer {
    let accepted = Arc::new(Mutex::new(HashSet::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let app = {
        let accepted = Arc::clone(&accepted);
        let seen = Arc::clone(&seen);
        Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
            let accepted = Arc::clone(&accepted);
            let seen = Arc::clone(&seen);
            async move {
                let auth = headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                seen.lock().push(auth.clone());

                let path = uri.path().to_owned();
                if path.starts_with("/public") {
                    return (StatusCode::OK, serde_json::json!({ "path": path }).to_string());
                }
                if path.starts_with("/broken") {
                    return (StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#.to_owned());
                }
                if path.starts_with("/slow") {
                    tokio::time::sleep(SLOW_RESPONSE).await;
                }
                let token = auth.as_deref().and_then(|a| a.strip_prefix("Bearer "));
                match token {
                    Some(t) if accepted.lock().contains(t) => {
                        (StatusCode::OK, serde_json::json!({ "path": path }).to_string())
                    }
                    _ => (StatusCode::UNAUTHORIZED, r#"{"error":"unauthorized"}"#.to_owned()),
                }
            }
        })
    };

    let addr = serve(app).await;
    MockApiServer { url: format!("http://{addr}"), accepted, seen }
}

/// An address nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}/auth/refresh")
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}
