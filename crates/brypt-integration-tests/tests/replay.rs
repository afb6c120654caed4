//! Integration test: replay rejection.
//!
//! A protected frame captured on the wire and re-injected after its
//! original delivery is dropped by the receiver: the handler runs once,
//! and the peer's invalid-frame counter increments by exactly one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brypt_integration_tests::{establish, memory_service, wait_for};
use brypt_message::{frame, Parcel};
use brypt_service::session::ProtectOutcome;
use brypt_service::{MemoryFabric, Next};
use brypt_types::NodeIdentifier;

#[tokio::test]
async fn reinjected_frame_is_dropped_once_delivered() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");

    let deliveries = Arc::new(AtomicUsize::new(0));
    let observed = deliveries.clone();
    omega
        .route("/echo", move |_: &NodeIdentifier, payload: &[u8], _: Next| {
            assert_eq!(payload, b"once");
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("route");

    establish(&alpha, &omega, "omega").await;

    // =========================================================
    // Step 1: Protect one notice by hand so the raw wire frame can
    // be captured and re-injected.
    // =========================================================
    let proxy = alpha.peer(&omega.identifier()).expect("peer proxy");
    let body = {
        let mut guard = proxy.session().lock().await;
        let session = guard.as_mut().expect("active session");
        let notice = Parcel::notice(alpha.identifier(), "/echo", b"once".to_vec());
        match session.protect(notice).expect("protect") {
            ProtectOutcome::Frame(body) => body,
            ProtectOutcome::Queued => unreachable!("no rekey in flight"),
        }
    };
    let framed = frame::encode_frame(&body).expect("frame");
    let link = proxy.link().expect("live link");

    // =========================================================
    // Step 2: Deliver the frame, then replay it verbatim.
    // =========================================================
    link.endpoint.send(link.connection, framed.clone()).expect("send");
    let delivered = {
        let deliveries = deliveries.clone();
        move || deliveries.load(Ordering::SeqCst) == 1
    };
    assert!(wait_for(Duration::from_secs(5), delivered).await, "first delivery missed");

    link.endpoint.send(link.connection, framed).expect("replay");

    // =========================================================
    // Step 3: The duplicate increments the invalid-frame counter
    // without reaching the handler.
    // =========================================================
    let omega_proxy_for = omega.peer(&alpha.identifier()).expect("peer proxy");
    let counted = {
        let proxy = omega_proxy_for.clone();
        move || proxy.statistics().invalid_frames() == 1
    };
    assert!(wait_for(Duration::from_secs(5), counted).await, "replay not counted");
    assert_eq!(deliveries.load(Ordering::SeqCst), 1, "handler ran on a replayed frame");

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}
