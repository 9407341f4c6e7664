#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use millstream::{EventLoop, EventLoopConfig, SecureContext};
use rustls::{
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    RootCertStore,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn event_loop() -> EventLoop {
    init_tracing();
    EventLoop::new(
        EventLoopConfig::builder()
            .dispatchers(2)
            .worker_pool(2, 8)
            .sweep_interval(Duration::from_millis(20))
            .build(),
    )
    .unwrap()
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Self-signed server context and a client context trusting it.
pub fn tls_contexts() -> (SecureContext, SecureContext) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server = SecureContext::server(SecureContext::server_config(vec![cert_der.clone()], key).unwrap());
    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = SecureContext::client(SecureContext::client_config(roots).unwrap(), "localhost").unwrap();
    (server, client)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub type Shared<T> = Arc<parking_lot::Mutex<T>>;
