//! Hybrid-transport path selection: a local peer is reached over ux, and
//! in its absence the client falls through to TLS. Full TLS sessions
//! need deployed certificate material, so the TLS leg is pinned down to
//! the fallback decision and its certificate-discovery failure mode.

use std::thread;

use once_cell::sync::Lazy;
use xcm::{AttrValue, Error, Socket};

/// Point certificate discovery at an empty directory, once, before any
/// test can touch TLS.
static EMPTY_CERT_DIR: Lazy<tempfile::TempDir> = Lazy::new(|| {
    let dir = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var("XCM_TLS_CERT", dir.path()) };
    dir
});

fn unique_port(salt: u16) -> u16 {
    20000 + (std::process::id() as u16 % 20000) + salt
}

#[test]
fn utls_connect_prefers_the_local_path() {
    Lazy::force(&EMPTY_CERT_DIR);
    let tail = format!("127.0.0.1:{}", unique_port(0));

    // A same-namespace server publishes the address in the local
    // namespace; utls:<host>:<port> pairs with ux:<host>:<port>.
    let mut server = Socket::server(&format!("ux:{tail}")).unwrap();

    let utls_addr = format!("utls:{tail}");
    let client = thread::spawn(move || {
        let mut conn = Socket::connect(&utls_addr).unwrap();

        // The hybrid socket masquerades as the transport in use.
        assert_eq!(conn.attr_get("xcm.transport").unwrap(), AttrValue::Str("ux".into()));

        conn.send(b"hi").unwrap();
        assert_eq!(conn.attr_get("xcm.from_app_bytes").unwrap(), AttrValue::Int(2));
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 16];
    let n = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");
    assert_eq!(conn.attr_get("xcm.to_app_bytes").unwrap(), AttrValue::Int(2));
    client.join().unwrap();
}

#[test]
fn utls_falls_back_to_tls_without_a_local_peer() {
    Lazy::force(&EMPTY_CERT_DIR);
    let addr = format!("utls:127.0.0.1:{}", unique_port(7));

    // No local listener: the refused probe routes the connect to the
    // TLS leg, which here stops at certificate discovery.
    let err = Socket::connect(&addr).unwrap_err();
    match err {
        Error::ProtocolError(msg) => assert!(msg.contains("missing TLS material")),
        other => panic!("expected the TLS leg to run, got {other:?}"),
    }
}

#[test]
fn utls_server_requires_certificate_material() {
    Lazy::force(&EMPTY_CERT_DIR);
    let addr = format!("utls:127.0.0.1:{}", unique_port(11));

    // The server binds its TLS listener first; missing material is a
    // protocol error at socket creation.
    let err = Socket::server(&addr).unwrap_err();
    assert!(matches!(err, Error::ProtocolError(_)));
}

#[test]
fn utls_rejects_malformed_addresses() {
    assert!(matches!(
        Socket::connect("utls:no-port-here").unwrap_err(),
        Error::InvalidInput(_)
    ));
    assert!(matches!(Socket::server("utls:").unwrap_err(), Error::InvalidInput(_)));
}

#[test]
fn unknown_protocol_tag_is_reported() {
    assert_eq!(
        Socket::connect("quic:127.0.0.1:1").unwrap_err(),
        Error::NoTransport("quic".into())
    );
}
