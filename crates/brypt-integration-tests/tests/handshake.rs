//! Integration tests: session establishment.
//!
//! Exercises the complete handshake pipeline over live transports:
//! 1. Two nodes negotiate an AES-256-CTR session over TCP and both report
//!    the peer as authorized.
//! 2. Disjoint cipher catalogs abort the handshake with `not_supported`.
//! 3. A network-token mismatch fails the transcript MAC and flags the peer.

use std::time::Duration;

use brypt_crypto::cipher::CipherAlgorithm;
use brypt_integration_tests::{
    events_snapshot, high_tier, memory_address, memory_service, record_events,
    standard_algorithms, wait_for,
};
use brypt_service::{AuthorizationState, MemoryFabric, Service};
use brypt_types::{Error, Event, OptionKey, Protocol, RemoteAddress};

#[tokio::test]
async fn tcp_handshake_negotiates_aes256() {
    // =========================================================
    // Step 1: Both nodes advertise the same high tier.
    // =========================================================
    let alpha = Service::new();
    let omega = Service::new();
    alpha.set_supported_algorithms(standard_algorithms()).expect("algorithms");
    omega.set_supported_algorithms(standard_algorithms()).expect("algorithms");

    let alpha_events = record_events(&alpha);
    let omega_events = record_events(&omega);

    omega
        .attach_endpoint(Protocol::Tcp, "lo", "127.0.0.1:35216", None)
        .expect("attach omega");
    alpha
        .attach_endpoint(Protocol::Tcp, "lo", "127.0.0.1:0", None)
        .expect("attach alpha");

    // =========================================================
    // Step 2: Alpha dials omega's listen address.
    // =========================================================
    omega.startup().expect("omega startup");
    alpha.startup().expect("alpha startup");
    alpha
        .connect(RemoteAddress::new(Protocol::Tcp, "127.0.0.1:35216", true).expect("address"))
        .expect("connect");

    let authorized = {
        let alpha = alpha.clone();
        let omega = omega.clone();
        let alpha_id = alpha.identifier();
        let omega_id = omega.identifier();
        move || {
            let alpha_sees =
                alpha.peer(&omega_id).map(|peer| peer.is_authorized()).unwrap_or(false);
            let omega_sees =
                omega.peer(&alpha_id).map(|peer| peer.is_authorized()).unwrap_or(false);
            alpha_sees && omega_sees
        }
    };
    assert!(wait_for(Duration::from_secs(5), authorized).await, "handshake did not complete");

    // =========================================================
    // Step 3: Both sides emitted peer_connected and the session runs
    // the negotiated cipher.
    // =========================================================
    for events in [events_snapshot(&alpha_events), events_snapshot(&omega_events)] {
        assert!(
            events.iter().any(|event| matches!(event, Event::PeerConnected { .. })),
            "missing peer_connected"
        );
    }

    let proxy = alpha.peer(&omega.identifier()).expect("peer proxy");
    let cipher = {
        let guard = proxy.session().lock().await;
        guard.as_ref().map(|session| session.suite().cipher)
    };
    assert_eq!(cipher, Some(CipherAlgorithm::Aes256Ctr));

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn disjoint_catalogs_abort_with_not_supported() {
    let fabric = MemoryFabric::new();

    // Alpha only speaks AES-128; omega only AES-256.
    let alpha = Service::new();
    alpha
        .set_supported_algorithms(high_tier(&["kem-x25519"], &["aes-128-ctr"], &["blake3"]))
        .expect("algorithms");
    alpha.attach_custom_endpoint(fabric.endpoint("alpha"), None).expect("attach");

    let omega = Service::new();
    omega
        .set_supported_algorithms(high_tier(&["kem-x25519"], &["aes-256-ctr"], &["blake3"]))
        .expect("algorithms");
    omega.attach_custom_endpoint(fabric.endpoint("omega"), None).expect("attach");

    let alpha_events = record_events(&alpha);
    let omega_events = record_events(&omega);

    omega.startup().expect("omega startup");
    alpha.startup().expect("alpha startup");
    alpha.connect(memory_address("omega")).expect("connect");

    // The initiator learns the refusal cause rather than timing out.
    let observed = {
        let alpha_events = alpha_events.clone();
        move || {
            events_snapshot(&alpha_events).iter().any(|event| {
                matches!(
                    event,
                    Event::PeerDisconnected { cause: Error::NotSupported, .. }
                )
            })
        }
    };
    assert!(wait_for(Duration::from_secs(5), observed).await, "no not_supported disconnect");

    for events in [events_snapshot(&alpha_events), events_snapshot(&omega_events)] {
        assert!(
            !events.iter().any(|event| matches!(event, Event::PeerConnected { .. })),
            "no session should have been authorized"
        );
    }

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}

#[tokio::test]
async fn network_token_mismatch_flags_the_peer() {
    let fabric = MemoryFabric::new();
    let alpha = memory_service(&fabric, "alpha");
    let omega = memory_service(&fabric, "omega");
    alpha.set_option(OptionKey::NetworkToken, "alpha-net").expect("token");
    omega.set_option(OptionKey::NetworkToken, "omega-net").expect("token");

    let alpha_events = record_events(&alpha);

    omega.startup().expect("omega startup");
    alpha.startup().expect("alpha startup");
    alpha.connect(memory_address("omega")).expect("connect");

    let denied = {
        let alpha_events = alpha_events.clone();
        move || {
            events_snapshot(&alpha_events).iter().any(|event| {
                matches!(
                    event,
                    Event::PeerDisconnected { cause: Error::AccessDenied, .. }
                )
            })
        }
    };
    assert!(wait_for(Duration::from_secs(5), denied).await, "no access_denied disconnect");

    // The offending peer is flagged until the operator clears it.
    let proxy = alpha.peer(&omega.identifier()).expect("peer proxy");
    assert_eq!(proxy.authorization_state(), AuthorizationState::Flagged);

    alpha.unflag(&omega.identifier()).expect("unflag");
    assert_eq!(proxy.authorization_state(), AuthorizationState::Unauthorized);

    alpha.shutdown().expect("alpha shutdown");
    omega.shutdown().expect("omega shutdown");
}
