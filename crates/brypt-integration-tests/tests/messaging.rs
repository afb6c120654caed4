//! Integration tests: routed messaging and request correlation.
//!
//! 1. A directed `/ping` request returns `pong!` with status 200.
//! 2. A handler that does nothing yields an automatic `no_content` reply.
//! 3. A request to an unregistered route yields `not_found`.
//! 4. A broadcast over two peers accounts for every responder exactly once
//!    (responses plus timeouts).
//! 5. The built-in `/brypt/heartbeat` and `/brypt/information` routes
//!    answer from every node.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use brypt_integration_tests::{establish, memory_service, wait_for};
use brypt_service::{MemoryFabric, Next, Response};
use brypt_types::{Error, NodeIdentifier, StatusCode};

fn response_slot() -> (Arc<Mutex<Vec<Response>>>, Arc<dyn Fn(Response) + Send + Sync>) {
    let slot: Arc<Mutex<Vec<Response>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = slot.clone();
    let callback = Arc::new(move |response: Response| {
        if let Ok(mut responses) = sink.lock() {
            responses.push(response);
        }
    });
    (slot, callback)
}

fn error_slot() -> (
    Arc<Mutex<Vec<(NodeIdentifier, Error)>>>,
    Arc<dyn Fn(NodeIdentifier, Error) + Send + Sync>,
) {
    let slot: Arc<Mutex<Vec<(NodeIdentifier, Error)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = slot.clone();
    let callback = Arc::new(move |peer: NodeIdentifier, error: Error| {
        if let Ok(mut errors) = sink.lock() {
            errors.push((peer, error));
        }
    });
    (slot, callback)
}

#[tokio::test]
async fn directed_ping_round_trip() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");

    omega
        .route("/ping", |_source: &NodeIdentifier, payload: &[u8], next: Next| {
            assert_eq!(payload, b"ping!");
            next.respond(b"pong!", StatusCode::Ok)
        })
        .expect("route");

    establish(&alpha, &omega, "omega").await;

    let (responses, on_response) = response_slot();
    let (errors, on_error) = error_slot();
    alpha
        .request(&omega.identifier(), "/ping", b"ping!".to_vec(), on_response, on_error)
        .expect("request");

    let arrived = {
        let responses = responses.clone();
        move || responses.lock().map(|r| !r.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "no response arrived");

    let responses = responses.lock().expect("responses");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload, b"pong!");
    assert_eq!(responses[0].status, StatusCode::Ok);
    assert_eq!(responses[0].status.value(), 200);
    assert_eq!(responses[0].source, omega.identifier());
    assert!(errors.lock().expect("errors").is_empty());

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn silent_handler_yields_no_content() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");

    omega
        .route("/noop", |_: &NodeIdentifier, _: &[u8], _: Next| Ok(()))
        .expect("route");

    establish(&alpha, &omega, "omega").await;

    let (responses, on_response) = response_slot();
    let (_errors, on_error) = error_slot();
    alpha
        .request(&omega.identifier(), "/noop", Vec::new(), on_response, on_error)
        .expect("request");

    let arrived = {
        let responses = responses.clone();
        move || responses.lock().map(|r| !r.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "no automatic reply");
    assert_eq!(responses.lock().expect("responses")[0].status, StatusCode::NoContent);

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn unregistered_route_yields_not_found() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");
    establish(&alpha, &omega, "omega").await;

    let (responses, on_response) = response_slot();
    let (_errors, on_error) = error_slot();
    alpha
        .request(&omega.identifier(), "/missing", Vec::new(), on_response, on_error)
        .expect("request");

    let arrived = {
        let responses = responses.clone();
        move || responses.lock().map(|r| !r.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "no reply");
    assert_eq!(responses.lock().expect("responses")[0].status, StatusCode::NotFound);

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn broadcast_accounts_for_every_responder() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let answering = memory_service(&fabric, "answering");
    let silent = memory_service(&fabric, "silent");

    answering
        .route("/poll", |_: &NodeIdentifier, _: &[u8], next: Next| {
            next.respond(b"here", StatusCode::Ok)
        })
        .expect("route");
    silent
        .route("/poll", |_: &NodeIdentifier, _: &[u8], next: Next| next.suspend())
        .expect("route");

    establish(&alpha, &answering, "answering").await;
    establish(&alpha, &silent, "silent").await;

    let (responses, on_response) = response_slot();
    let (errors, on_error) = error_slot();
    alpha
        .broadcast_request_with_deadline(
            "/poll",
            b"anyone?".to_vec(),
            Duration::from_millis(700),
            on_response,
            on_error,
        )
        .expect("broadcast");

    // Callbacks total exactly the authorized peer count at issue time.
    let settled = {
        let responses = responses.clone();
        let errors = errors.clone();
        move || {
            let responded = responses.lock().map(|r| r.len()).unwrap_or(0);
            let errored = errors.lock().map(|e| e.len()).unwrap_or(0);
            responded + errored == 2
        }
    };
    assert!(wait_for(Duration::from_secs(5), settled).await, "callbacks incomplete");

    let responses = responses.lock().expect("responses");
    let errors = errors.lock().expect("errors");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].source, answering.identifier());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, silent.identifier());
    assert_eq!(errors[0].1, Error::Timeout);

    alpha.shutdown().expect("alpha shutdown");
    answering.shutdown().expect("answering shutdown");
    silent.shutdown().expect("silent shutdown");
}

#[tokio::test]
async fn notices_reach_the_handler_without_replies() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");

    let delivered = Arc::new(AtomicUsize::new(0));
    let observed = delivered.clone();
    omega
        .route("/events/refresh", move |_: &NodeIdentifier, payload: &[u8], _: Next| {
            assert_eq!(payload, b"now");
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("route");

    establish(&alpha, &omega, "omega").await;
    alpha
        .notify(&omega.identifier(), "/events/refresh", b"now".to_vec())
        .expect("notify");

    let arrived = {
        let delivered = delivered.clone();
        move || delivered.load(Ordering::SeqCst) == 1
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "notice not delivered");

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn builtin_routes_answer() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");
    establish(&alpha, &omega, "omega").await;

    // Heartbeat.
    let (responses, on_response) = response_slot();
    let (_errors, on_error) = error_slot();
    alpha
        .request(&omega.identifier(), "/brypt/heartbeat", Vec::new(), on_response, on_error)
        .expect("heartbeat");
    let arrived = {
        let responses = responses.clone();
        move || responses.lock().map(|r| !r.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "no heartbeat reply");
    assert_eq!(responses.lock().expect("responses")[0].payload, b"alive");

    // Information.
    let (responses, on_response) = response_slot();
    let (_errors, on_error) = error_slot();
    alpha
        .request(&omega.identifier(), "/brypt/information", Vec::new(), on_response, on_error)
        .expect("information");
    let arrived = {
        let responses = responses.clone();
        move || responses.lock().map(|r| !r.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(5), arrived).await, "no information reply");

    let payload = responses.lock().expect("responses")[0].payload.clone();
    let document: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(
        document["identifier"].as_str(),
        Some(omega.identifier().to_text().as_str())
    );

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}
