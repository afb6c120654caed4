//! Shared harness helpers for the end-to-end scenario tests.
//!
//! The scenarios run real [`Service`] instances wired together over the
//! in-process [`MemoryFabric`] (one uses live TCP sockets), so they
//! exercise the full pipeline: framing, handshake, session encryption,
//! routing, and request correlation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use brypt_crypto::suite::{AlgorithmsPackage, ConfidentialityLevel};
use brypt_service::{MemoryFabric, Service};
use brypt_types::{Event, Protocol, RemoteAddress};

/// Install a compact tracing subscriber for debugging scenario runs.
/// Safe to call from several tests; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A high-tier advertisement built from algorithm names.
pub fn high_tier(kems: &[&str], ciphers: &[&str], digests: &[&str]) -> Vec<AlgorithmsPackage> {
    vec![AlgorithmsPackage {
        level: ConfidentialityLevel::High,
        key_agreements: kems.iter().map(|name| name.to_string()).collect(),
        ciphers: ciphers.iter().map(|name| name.to_string()).collect(),
        digests: digests.iter().map(|name| name.to_string()).collect(),
    }]
}

/// The advertisement every scenario node uses unless stated otherwise.
pub fn standard_algorithms() -> Vec<AlgorithmsPackage> {
    high_tier(&["kem-kyber768"], &["aes-256-ctr"], &["blake2b512"])
}

/// Poll `condition` every 10 ms until it holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Subscribe a recorder capturing every event the service emits.
pub fn record_events(service: &Service) -> Arc<Mutex<Vec<Event>>> {
    let log: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    service
        .subscribe_all(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        })
        .expect("subscribe recorder");
    log
}

/// Snapshot of a recorded event log.
pub fn events_snapshot(log: &Arc<Mutex<Vec<Event>>>) -> Vec<Event> {
    log.lock().map(|events| events.clone()).unwrap_or_default()
}

/// A service configured with the standard algorithms and one memory
/// endpoint listening at `uri` on the shared fabric. Not yet started.
pub fn memory_service(fabric: &MemoryFabric, uri: &str) -> Service {
    let service = Service::new();
    service
        .set_supported_algorithms(standard_algorithms())
        .expect("set algorithms");
    service
        .attach_custom_endpoint(fabric.endpoint(uri), None)
        .expect("attach endpoint");
    service
}

/// The memory-fabric address of a listening node.
pub fn memory_address(uri: &str) -> RemoteAddress {
    RemoteAddress::new(Protocol::Memory, uri, false).expect("memory address")
}

/// Start both services and connect `dialer` to `listener`, waiting until
/// each side authorizes the other.
pub async fn establish(dialer: &Service, listener: &Service, listener_uri: &str) {
    if !listener.is_running() {
        listener.startup().expect("listener startup");
    }
    if !dialer.is_running() {
        dialer.startup().expect("dialer startup");
    }
    dialer.connect(memory_address(listener_uri)).expect("connect");

    let dialer_sees = {
        let dialer = dialer.clone();
        let listener_id = listener.identifier();
        move || {
            dialer
                .peer(&listener_id)
                .map(|peer| peer.is_authorized())
                .unwrap_or(false)
        }
    };
    let listener_sees = {
        let listener = listener.clone();
        let dialer_id = dialer.identifier();
        move || {
            listener
                .peer(&dialer_id)
                .map(|peer| peer.is_authorized())
                .unwrap_or(false)
        }
    };
    assert!(
        wait_for(Duration::from_secs(5), move || dialer_sees() && listener_sees()).await,
        "peers failed to authorize each other"
    );
}
