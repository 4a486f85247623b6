// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::clock::ManualClock;
use crate::credential::slots::{CredentialSlots, MemorySlots};
use crate::credential::CredentialPair;
use crate::events::SessionEvent;
use crate::scheduler::{Fired, Scheduler};
use crate::test_http::{mock_api_server, mock_renew_server, renew_body, MockApiServer, MockRenewServer};
use crate::test_support::mint_token;

struct Fixture {
    guard: Arc<CallGuard>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RenewCoordinator>,
    teardown: Arc<Teardown>,
    clock: Arc<ManualClock>,
    api: MockApiServer,
    renew: MockRenewServer,
    events: broadcast::Receiver<SessionEvent>,
    _fired_rx: mpsc::Receiver<Fired>,
}

/// Signed in at t=1000 with a 900s token (renewal window opens at 1600).
/// The renew server hands out `renewed` with refresh token "refresh-1".
async fn fixture(renewed: &str, renew_delay: Duration) -> anyhow::Result<Fixture> {
    crate::ensure_crypto_provider();
    let api = mock_api_server().await;
    let renew =
        mock_renew_server(vec![(200, renew_body(renewed, Some("refresh-1"), 900))], renew_delay).await;

    let (fire_tx, fired_rx) = mpsc::channel(8);
    let scheduler = Arc::new(Scheduler::new(fire_tx));
    let clock = Arc::new(ManualClock::new(1000));
    let store = Arc::new(CredentialStore::new(
        Arc::new(MemorySlots::new()) as Arc<dyn CredentialSlots>,
        vec![],
        Arc::clone(&scheduler),
        Arc::clone(&clock) as Arc<dyn Clock>,
        300,
    ));
    let (event_tx, events) = broadcast::channel(256);
    let teardown = Arc::new(Teardown::new(
        Arc::clone(&store),
        scheduler,
        "https://app.example.test/login".to_owned(),
        event_tx.clone(),
    ));
    let http = reqwest::Client::new();
    let coordinator = Arc::new(RenewCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&teardown),
        http.clone(),
        renew.url.clone(),
        Duration::from_secs(2),
        event_tx,
    ));
    let guard = Arc::new(CallGuard::new(
        http,
        api.url.clone(),
        Validator::new(300),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&teardown),
    ));

    Ok(Fixture {
        guard,
        store,
        coordinator,
        teardown,
        clock,
        api,
        renew,
        events,
        _fired_rx: fired_rx,
    })
}

fn sign_in(fx: &Fixture, access: &str) -> anyhow::Result<()> {
    fx.store.write(&CredentialPair::new(access, "refresh-0"), 900)?;
    Ok(())
}

fn bearer(token: &str) -> Option<String> {
    Some(format!("Bearer {token}"))
}

#[tokio::test]
async fn valid_token_is_attached() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    let access = mint_token("u1", 1000, 1900);
    sign_in(&fx, &access)?;
    fx.api.accept(&access);

    let resp = fx.guard.call(&ApiRequest::get("/projects").requiring_auth()).await?;
    assert!(resp.is_success());
    assert_eq!(resp.json::<serde_json::Value>()?["path"], "/projects");
    assert_eq!(fx.api.seen(), vec![bearer(&access)]);
    assert_eq!(fx.renew.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn stale_token_is_renewed_before_sending() -> anyhow::Result<()> {
    let renewed = mint_token("u1", 1601, 2501);
    let fx = fixture(&renewed, Duration::ZERO).await?;
    let old = mint_token("u1", 1000, 1900);
    sign_in(&fx, &old)?;
    fx.api.accept(&old);
    fx.api.accept(&renewed);

    fx.clock.set(1601);
    let resp = fx.guard.call(&ApiRequest::get("/projects")).await?;
    assert!(resp.is_success());
    assert_eq!(fx.renew.call_count(), 1);
    assert_eq!(fx.api.seen(), vec![bearer(&renewed)]);
    Ok(())
}

#[tokio::test]
async fn concurrent_stale_calls_share_one_renewal() -> anyhow::Result<()> {
    let renewed = mint_token("u1", 1601, 2501);
    let fx = fixture(&renewed, Duration::from_millis(100)).await?;
    sign_in(&fx, &mint_token("u1", 1000, 1900))?;
    fx.api.accept(&renewed);
    fx.clock.set(1601);

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let guard = Arc::clone(&fx.guard);
            tokio::spawn(async move {
                guard.call(&ApiRequest::get(format!("/items/{i}")).requiring_auth()).await
            })
        })
        .collect();
    for call in futures_util::future::join_all(calls).await {
        assert!(call??.is_success());
    }

    assert_eq!(fx.renew.call_count(), 1);
    let seen = fx.api.seen();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|auth| *auth == bearer(&renewed)));
    Ok(())
}

#[tokio::test]
async fn absent_credentials_on_protected_call_tear_down() -> anyhow::Result<()> {
    let mut fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;

    let request = ApiRequest::get("/billing").requiring_auth().with_destination("/settings/billing");
    let err = fx.guard.call(&request).await.err();
    assert!(matches!(err, Some(GuardError::NotSignedIn)), "got {err:?}");
    assert_eq!(fx.api.request_count(), 0);

    match fx.events.try_recv()? {
        SessionEvent::SignInRequired { redirect } => {
            assert!(redirect.ends_with("return_to=%2Fsettings%2Fbilling"), "{redirect}");
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn absent_credentials_on_public_call_send_anonymously() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    let resp = fx.guard.call(&ApiRequest::get("/public/status")).await?;
    assert!(resp.is_success());
    assert_eq!(fx.api.seen(), vec![None]);
    assert!(!fx.teardown.is_closed());
    Ok(())
}

#[tokio::test]
async fn expired_soon_without_refresh_token_is_still_attached() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    let access = mint_token("u1", 1000, 1900);
    fx.store.write(&CredentialPair { access_token: access.clone(), refresh_token: None }, 900)?;
    fx.api.accept(&access);
    fx.clock.set(1700);

    let resp = fx.guard.call(&ApiRequest::get("/projects")).await?;
    assert!(resp.is_success());
    assert_eq!(fx.renew.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn rejection_triggers_renewal_and_single_retry() -> anyhow::Result<()> {
    let renewed = mint_token("u1", 1000, 1900);
    let fx = fixture(&renewed, Duration::ZERO).await?;
    let revoked = mint_token("u1", 1000, 1900);
    sign_in(&fx, &revoked)?;
    fx.api.accept(&renewed);

    let resp = fx.guard.call(&ApiRequest::post("/projects", serde_json::json!({"name": "x"}))).await?;
    assert!(resp.is_success());
    assert_eq!(fx.renew.call_count(), 1);
    assert_eq!(fx.api.seen(), vec![bearer(&revoked), bearer(&renewed)]);
    Ok(())
}

#[tokio::test]
async fn late_rejection_retries_with_already_renewed_token() -> anyhow::Result<()> {
    let renewed = mint_token("u1", 1000, 1900);
    let fx = fixture(&renewed, Duration::ZERO).await?;
    let revoked = mint_token("u1", 1000, 1900);
    sign_in(&fx, &revoked)?;
    fx.api.accept(&renewed);

    // Both calls go out with the revoked token; the slow one is rejected
    // only after the fast one has renewed.
    let slow = {
        let guard = Arc::clone(&fx.guard);
        tokio::spawn(async move { guard.call(&ApiRequest::get("/slow/report")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = fx.guard.call(&ApiRequest::get("/projects")).await?;
    assert!(fast.is_success());
    assert!(!fx.coordinator.is_renewing());

    let slow = slow.await??;
    assert!(slow.is_success());
    assert_eq!(fx.renew.call_count(), 1);
    assert_eq!(fx.coordinator.exchange_count(), 1);
    let seen = fx.api.seen();
    assert_eq!(seen.iter().filter(|auth| **auth == bearer(&revoked)).count(), 2);
    assert_eq!(seen.iter().filter(|auth| **auth == bearer(&renewed)).count(), 2);
    Ok(())
}

#[tokio::test]
async fn second_rejection_exhausts_retry() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    sign_in(&fx, &mint_token("u1", 1000, 1900))?;

    let err = fx.guard.call(&ApiRequest::get("/projects")).await.err();
    let Some(err) = err else { anyhow::bail!("expected RetryExhausted, got Ok") };
    assert!(!err.is_auth_failure());
    match err {
        GuardError::RetryExhausted { response } => assert_eq!(response.status, 401),
        other => anyhow::bail!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(fx.renew.call_count(), 1);
    assert_eq!(fx.api.request_count(), 2);
    assert!(fx.store.read().is_some(), "renewed pair stays in place");
    Ok(())
}

#[tokio::test]
async fn failed_renewal_propagates_rejection() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    // Point a second coordinator at a rejecting endpoint.
    let rejecting = mock_renew_server(
        vec![(401, r#"{"error":"invalid_grant"}"#.to_owned())],
        Duration::ZERO,
    )
    .await;
    let (event_tx, _) = broadcast::channel(16);
    let coordinator = Arc::new(RenewCoordinator::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.teardown),
        reqwest::Client::new(),
        rejecting.url.clone(),
        Duration::from_secs(2),
        event_tx,
    ));
    let guard = CallGuard::new(
        reqwest::Client::new(),
        fx.api.url.clone(),
        Validator::new(300),
        Arc::clone(&fx.clock) as Arc<dyn Clock>,
        Arc::clone(&fx.store),
        coordinator,
        Arc::clone(&fx.teardown),
    );
    sign_in(&fx, &mint_token("u1", 1000, 1900))?;

    let err = guard.call(&ApiRequest::get("/projects")).await.err();
    match err {
        Some(GuardError::Unauthorized { response, renewal: Some(RenewError::Rejected(_)) }) => {
            assert_eq!(response.status, 401);
        }
        other => anyhow::bail!("expected Unauthorized with rejection, got {other:?}"),
    }
    assert!(fx.store.read().is_none());
    assert!(fx.teardown.is_closed());
    assert_eq!(fx.api.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn non_auth_failures_pass_through() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::ZERO).await?;
    let access = mint_token("u1", 1000, 1900);
    sign_in(&fx, &access)?;

    let resp = fx.guard.call(&ApiRequest::get("/broken/thing")).await?;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.text(), r#"{"error":"boom"}"#);
    assert_eq!(fx.renew.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn teardown_interrupts_queued_retry() -> anyhow::Result<()> {
    let fx = fixture(&mint_token("u1", 1000, 1900), Duration::from_millis(500)).await?;
    sign_in(&fx, &mint_token("u1", 1000, 1900))?;

    let call = {
        let guard = Arc::clone(&fx.guard);
        tokio::spawn(async move { guard.call(&ApiRequest::get("/projects")).await })
    };
    // Let the call get rejected and start waiting on the renewal.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(fx.coordinator.is_renewing());
    assert!(fx.teardown.run(None));

    let err = call.await?.err();
    assert!(matches!(err, Some(GuardError::SessionEnded)), "got {err:?}");

    // The late renewal result must not resurrect the session.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(fx.store.read().is_none());
    Ok(())
}

#[test]
fn request_builders() {
    let req = ApiRequest::post("/a", serde_json::json!({"k": 1}))
        .requiring_auth()
        .with_destination("/back");
    assert_eq!(req.method, Method::POST);
    assert!(req.requires_auth);
    assert_eq!(req.destination.as_deref(), Some("/back"));
    assert_eq!(req.body, Some(serde_json::json!({"k": 1})));

    let get = ApiRequest::get("/b");
    assert_eq!(get.method, Method::GET);
    assert!(!get.requires_auth);
    assert!(get.body.is_none());
}
