//! Integration test: request deadlines and responder-side cancellation.
//!
//! A `/slow` handler suspends its reply and never answers. The issuer
//! observes exactly one `timeout` error (and no response), and the
//! abandonment notice trips the responder-side cancellation token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use brypt_integration_tests::{establish, memory_service, wait_for};
use brypt_service::{CancellationToken, MemoryFabric, Next};
use brypt_types::{Error, NodeIdentifier};

#[tokio::test]
async fn abandoned_request_times_out_and_cancels_the_handler() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");

    // =========================================================
    // Step 1: The slow handler takes ownership of the reply and
    // parks, watching its cancellation token.
    // =========================================================
    let token_slot: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let captured = token_slot.clone();
    omega
        .route("/slow", move |_: &NodeIdentifier, _: &[u8], next: Next| {
            if let Ok(mut slot) = captured.lock() {
                *slot = Some(next.cancellation());
            }
            next.suspend()
        })
        .expect("route");

    establish(&alpha, &omega, "omega").await;

    // =========================================================
    // Step 2: Issue with a 500 ms deadline; nothing ever answers.
    // =========================================================
    let responses = Arc::new(AtomicUsize::new(0));
    let errors: Arc<Mutex<Vec<(NodeIdentifier, Error)>>> = Arc::new(Mutex::new(Vec::new()));
    let response_sink = responses.clone();
    let error_sink = errors.clone();
    alpha
        .request_with_deadline(
            &omega.identifier(),
            "/slow",
            b"take your time".to_vec(),
            Duration::from_millis(500),
            Arc::new(move |_| {
                response_sink.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |peer, error| {
                if let Ok(mut sink) = error_sink.lock() {
                    sink.push((peer, error));
                }
            }),
        )
        .expect("request");

    // =========================================================
    // Step 3: Exactly one timeout error, no responses.
    // =========================================================
    let timed_out = {
        let errors = errors.clone();
        move || errors.lock().map(|e| !e.is_empty()).unwrap_or(false)
    };
    assert!(wait_for(Duration::from_secs(3), timed_out).await, "deadline never fired");

    // Allow a grace period for any late (and incorrect) callbacks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let errors = errors.lock().expect("errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, omega.identifier());
        assert_eq!(errors[0].1, Error::Timeout);
    }
    assert_eq!(responses.load(Ordering::SeqCst), 0);

    // =========================================================
    // Step 4: The abandonment notice reached the handler's token.
    // =========================================================
    let cancelled = {
        let token_slot = token_slot.clone();
        move || {
            token_slot
                .lock()
                .ok()
                .and_then(|slot| slot.as_ref().map(CancellationToken::is_cancelled))
                .unwrap_or(false)
        }
    };
    assert!(wait_for(Duration::from_secs(3), cancelled).await, "token never tripped");

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}
