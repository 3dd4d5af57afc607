//! Service lifecycle tests against a mock cart endpoint.
//!
//! Drives the full stack (service, session store, scheduler, batch runner,
//! HTTP prober) and checks the observable contract: events, artifacts and
//! the one-watch-per-session guarantee.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use voucher_guard::events::EventReceiver;
use voucher_guard::{
    FinalReport, GuardConfig, GuardError, GuardService, SessionId, WatchEventKind,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cookie() -> String {
    format!("sid={}", "z".repeat(140))
}

fn config(server: &MockServer) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.endpoint.base_url = server.uri();
    config.batch.code_delay_ms = 10;
    config.watch.interval_secs = 1;
    config.watch.error_backoff_secs = 1;
    config
}

async fn mount_cart(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/cart/apply-voucher"))
        .and(body_partial_json(json!({"voucherId": "SVH001"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"voucherId": "SVH001", "discount": 400}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/cart/apply-voucher"))
        .and(body_partial_json(json!({"voucherId": "SVH002"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorMessage": {"errors": [{"type": "VoucherError", "message": "Minimum cart value not met"}]}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/cart/apply-voucher"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorMessage": {"errors": [{"type": "VoucherError", "message": "Voucher code is invalid"}]}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/cart/reset-voucher"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

async fn wait_for_stop(events: &mut EventReceiver) -> (Vec<u64>, FinalReport) {
    let mut cycles = Vec::new();
    let next = async {
        while let Some(event) = events.recv().await {
            match event.kind {
                WatchEventKind::CycleCompleted(report) => cycles.push(report.cycle),
                WatchEventKind::Stopped(report) => return Some(report),
                _ => {}
            }
        }
        None
    };
    let report = tokio::time::timeout(Duration::from_secs(20), next)
        .await
        .expect("watch did not stop in time")
        .expect("event stream closed");
    (cycles, report)
}

async fn reset_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/cart/reset-voucher")
        .count()
}

#[tokio::test]
async fn test_single_pass_check_classifies_each_code() {
    let server = MockServer::start().await;
    mount_cart(&server).await;

    let (service, _events) = GuardService::from_config(config(&server)).expect("service");
    let id = SessionId::from(100_i64);
    service.set_credential(&id, &cookie()).await.expect("credential");

    let codes = service
        .submit_codes(&id, "=== codes ===\nSVH001\n# note\nSVH002\nBADCODE\n")
        .expect("codes");
    let outcome = service.check_once(&id, &codes).await.expect("check");

    assert_eq!(outcome.accepted, vec!["SVH001", "SVH002"]);
    assert_eq!(outcome.rejected, vec!["BADCODE"]);
    assert_eq!(outcome.auth_error_count, 0);
    // Validation probe is never reset; each checked code is reset once.
    assert_eq!(reset_count(&server).await, 3);
}

#[tokio::test]
async fn test_watch_runs_until_cancelled_then_final_pass() {
    let server = MockServer::start().await;
    mount_cart(&server).await;

    let (service, mut events) = GuardService::from_config(config(&server)).expect("service");
    let id = SessionId::from("watcher");
    service.set_credential(&id, &cookie()).await.expect("credential");
    service.submit_codes(&id, "SVH001\nBADCODE").expect("codes");
    service.start_watch(&id).expect("start");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    service.cancel_watch(&id).expect("cancel");

    let (cycles, report) = wait_for_stop(&mut events).await;
    assert!(!cycles.is_empty());
    assert!(cycles.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(report.accepted, vec!["SVH001"]);
    assert_eq!(report.rejected, vec!["BADCODE"]);
    assert!(report.error.is_none());

    let status = service.status(&id);
    assert!(!status.watching);
    assert_eq!(status.code_count, 0);

    let dir = tempfile::tempdir().expect("tempdir");
    let (accepted, _) = report.artifacts().write_to_dir(dir.path()).expect("write");
    assert_eq!(std::fs::read_to_string(accepted).expect("read"), "SVH001\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_attempts_create_one_task() {
    let server = MockServer::start().await;
    mount_cart(&server).await;

    let (service, mut events) = GuardService::from_config(config(&server)).expect("service");
    let service = Arc::new(service);
    let id = SessionId::from(7_i64);
    service.set_credential(&id, &cookie()).await.expect("credential");
    service.submit_codes(&id, "SVH001").expect("codes");

    let attempts: Vec<_> = (0..12)
        .map(|_| {
            let service = Arc::clone(&service);
            let id = id.clone();
            tokio::spawn(async move { service.start_watch(&id) })
        })
        .collect();

    let mut started = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.expect("join") {
            Ok(()) => started += 1,
            Err(GuardError::AlreadyWatching(_)) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(rejected, 11);
    assert_eq!(service.active_watches(), 1);

    service.cancel_watch(&id).expect("cancel");
    let (_, report) = wait_for_stop(&mut events).await;
    assert_eq!(report.accepted, vec!["SVH001"]);
    assert_eq!(service.active_watches(), 0);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let server = MockServer::start().await;
    mount_cart(&server).await;

    let (service, mut events) = GuardService::from_config(config(&server)).expect("service");
    let alice = SessionId::from("alice");
    let bob = SessionId::from("bob");
    for id in [&alice, &bob] {
        service.set_credential(id, &cookie()).await.expect("credential");
    }
    service.submit_codes(&alice, "SVH001").expect("codes");
    service.submit_codes(&bob, "BADCODE").expect("codes");
    service.start_watch(&alice).expect("start alice");
    service.start_watch(&bob).expect("start bob");
    assert_eq!(service.active_watches(), 2);

    service.cancel_watch(&bob).expect("cancel bob");
    let (_, report) = wait_for_stop(&mut events).await;
    assert_eq!(report.rejected, vec!["BADCODE"]);
    assert!(service.status(&alice).watching);

    service.shutdown().await;
    assert_eq!(service.active_watches(), 0);
}

#[tokio::test]
async fn test_expired_credential_is_rejected_before_watch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (service, _events) = GuardService::from_config(config(&server)).expect("service");
    let id = SessionId::from(1_i64);
    let err = service
        .set_credential(&id, &cookie())
        .await
        .expect_err("401 must reject");
    assert!(matches!(err, GuardError::CredentialRejected(_)));

    service.submit_codes(&id, "SVH001").expect("codes");
    let err = service.start_watch(&id).expect_err("no credential");
    assert!(matches!(err, GuardError::CredentialMissing(_)));
    assert_eq!(service.active_watches(), 0);
}
