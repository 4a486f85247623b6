// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end session scenarios against local API and renewal servers.

use std::sync::Arc;
use std::time::Duration;

use keeper::clock::{Clock, ManualClock};
use keeper::credential::claims::TokenStatus;
use keeper::credential::slots::{CredentialSlots, MemorySlots};
use keeper::credential::CredentialPair;
use keeper::error::GuardError;
use keeper::events::SessionEvent;
use keeper::guard::ApiRequest;
use keeper::session::Session;
use keeper::test_support::{mint_token, test_config};

#[path = "../src/test_http.rs"]
mod test_http;

use test_http::{mock_api_server, mock_renew_server, renew_body, MockApiServer, MockRenewServer};

/// Session start time; the scenario's t=0.
const T0: u64 = 1_700_000_000;

struct Harness {
    session: Arc<Session>,
    clock: Arc<ManualClock>,
    api: MockApiServer,
    renew: MockRenewServer,
}

async fn harness(renew_responses: Vec<(u16, String)>, delay: Duration) -> anyhow::Result<Harness> {
    let api = mock_api_server().await;
    let renew = mock_renew_server(renew_responses, delay).await;
    let clock = Arc::new(ManualClock::new(T0));
    let session = Session::with_parts(
        &test_config(&api.url, &renew.url),
        Arc::new(MemorySlots::new()) as Arc<dyn CredentialSlots>,
        vec![],
        Arc::clone(&clock) as Arc<dyn Clock>,
        None,
    )?;
    Ok(Harness { session, clock, api, renew })
}

#[tokio::test]
async fn ten_calls_in_renewal_window_share_one_exchange() -> anyhow::Result<()> {
    let renewed = mint_token("u1", T0 + 601, T0 + 1501);
    let h = harness(
        vec![(200, renew_body(&renewed, Some("refresh-1"), 900))],
        Duration::from_millis(100),
    )
    .await?;
    let original = mint_token("u1", T0, T0 + 900);
    h.session.sign_in(CredentialPair::new(&original, "refresh-0"), 900)?;
    h.api.accept(&original);
    h.api.accept(&renewed);

    assert_eq!(h.session.status().token_status, Some(TokenStatus::Valid));
    h.clock.set(T0 + 599);
    assert_eq!(h.session.status().token_status, Some(TokenStatus::Valid));
    h.clock.set(T0 + 601);
    assert_eq!(h.session.status().token_status, Some(TokenStatus::ExpiredSoon));

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move {
                session.call(&ApiRequest::get(format!("/reports/{i}")).requiring_auth()).await
            })
        })
        .collect();
    for call in futures_util::future::join_all(calls).await {
        assert!(call??.is_success());
    }

    assert_eq!(h.renew.call_count(), 1);
    assert_eq!(h.session.renewal_exchanges(), 1);
    let expected = Some(format!("Bearer {renewed}"));
    let seen = h.api.seen();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|auth| *auth == expected));

    h.clock.set(T0 + 900);
    assert_eq!(h.session.status().token_status, Some(TokenStatus::Valid));
    h.session.shutdown();
    Ok(())
}

#[tokio::test]
async fn twice_rejected_call_stops_after_one_renewal() -> anyhow::Result<()> {
    let h = harness(
        vec![(200, renew_body(&mint_token("u1", T0, T0 + 900), Some("refresh-1"), 900))],
        Duration::ZERO,
    )
    .await?;
    h.session.sign_in(CredentialPair::new(mint_token("u1", T0, T0 + 900), "refresh-0"), 900)?;

    let err = h.session.call(&ApiRequest::get("/reports")).await.err();
    assert!(matches!(err, Some(GuardError::RetryExhausted { .. })), "got {err:?}");
    assert_eq!(h.renew.call_count(), 1);
    assert_eq!(h.api.request_count(), 2);
    assert!(h.session.status().signed_in);
    h.session.shutdown();
    Ok(())
}

#[tokio::test]
async fn revoked_refresh_token_tears_down_once() -> anyhow::Result<()> {
    let h = harness(
        vec![(401, r#"{"error":"invalid_grant"}"#.to_owned())],
        Duration::from_millis(100),
    )
    .await?;
    h.session.sign_in(CredentialPair::new(mint_token("u1", T0, T0 + 900), "refresh-0"), 900)?;
    let mut events = h.session.subscribe();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move {
                session
                    .call(&ApiRequest::get("/reports").with_destination("/dashboard/reports"))
                    .await
            })
        })
        .collect();
    for call in futures_util::future::join_all(calls).await {
        let err = call?.err();
        assert!(err.as_ref().is_some_and(GuardError::is_auth_failure), "got {err:?}");
    }

    assert_eq!(h.renew.call_count(), 1);
    assert!(!h.session.status().signed_in);

    let mut redirects = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::SignInRequired { redirect } = event {
            redirects.push(redirect);
        }
    }
    assert_eq!(
        redirects,
        vec!["https://app.example.test/login?return_to=%2Fdashboard%2Freports".to_owned()]
    );

    // A fresh sign-in starts a new session that can be torn down again.
    h.session.sign_in(CredentialPair::new(mint_token("u1", T0, T0 + 900), "refresh-2"), 900)?;
    h.session.sign_out()?;
    let again = events.recv().await?;
    assert!(matches!(again, SessionEvent::SignedIn { .. }));
    assert!(matches!(events.recv().await?, SessionEvent::SignInRequired { .. }));
    Ok(())
}

#[tokio::test]
async fn unreachable_renewal_keeps_credentials() -> anyhow::Result<()> {
    let api = mock_api_server().await;
    let offline = test_http::closed_port_url().await;
    let session = Session::with_parts(
        &test_config(&api.url, &offline),
        Arc::new(MemorySlots::new()) as Arc<dyn CredentialSlots>,
        vec![],
        Arc::new(ManualClock::new(T0)) as Arc<dyn Clock>,
        None,
    )?;
    let mut events = session.subscribe();
    session.sign_in(CredentialPair::new(mint_token("u1", T0, T0 + 900), "refresh-0"), 900)?;

    assert!(!session.renew().await);
    let status = session.status();
    assert!(status.signed_in);
    assert!(status.has_refresh_token);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::SignInRequired { .. }), "unexpected teardown");
    }
    session.shutdown();
    Ok(())
}
