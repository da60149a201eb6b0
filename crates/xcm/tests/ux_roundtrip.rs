use std::thread;

use xcm::{AttrValue, Error, Socket};

fn unique_name(tag: &str) -> String {
    format!("xcm-test-{}-{tag}", std::process::id())
}

#[test]
fn ux_roundtrip_with_counters() {
    let addr = format!("ux:{}", unique_name("roundtrip"));
    let mut server = Socket::server(&addr).unwrap();
    assert_eq!(server.local_addr().unwrap(), addr);
    assert_eq!(server.attr_get("xcm.type").unwrap(), AttrValue::Str("server".into()));

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = Socket::connect(&client_addr).unwrap();
        conn.send(b"hi").unwrap();

        assert_eq!(conn.attr_get("xcm.transport").unwrap(), AttrValue::Str("ux".into()));
        assert_eq!(conn.attr_get("xcm.from_app_msgs").unwrap(), AttrValue::Int(1));
        assert_eq!(conn.attr_get("xcm.from_app_bytes").unwrap(), AttrValue::Int(2));

        let mut buf = [0u8; 16];
        let n = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 16];
    let n = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");
    assert_eq!(conn.attr_get("xcm.to_app_bytes").unwrap(), AttrValue::Int(2));
    assert_eq!(conn.attr_get("xcm.from_lower_msgs").unwrap(), AttrValue::Int(1));

    conn.send(b"ok").unwrap();
    client.join().unwrap();
}

#[test]
fn messages_arrive_in_send_order() {
    let addr = format!("ux:{}", unique_name("ordering"));
    let mut server = Socket::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = Socket::connect(&client_addr).unwrap();
        for i in 0u32..100 {
            conn.send(&i.to_be_bytes()).unwrap();
        }
        // Hold the connection until the peer drained everything.
        let mut buf = [0u8; 4];
        conn.receive(&mut buf).unwrap();
    });

    let mut conn = server.accept().unwrap();
    for i in 0u32..100 {
        let mut buf = [0u8; 4];
        assert_eq!(conn.receive(&mut buf).unwrap(), 4);
        assert_eq!(u32::from_be_bytes(buf), i);
    }
    conn.send(b"done").unwrap();
    client.join().unwrap();
}

#[test]
fn connect_to_missing_name_is_refused() {
    let err = Socket::connect(&format!("ux:{}", unique_name("nobody"))).unwrap_err();
    assert_eq!(err, Error::ConnectionRefused);
}

#[test]
fn uxf_server_unlinks_its_path_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.sock");
    let addr = format!("uxf:{}", path.display());

    let server = Socket::server(&addr).unwrap();
    assert!(path.exists());

    // A second bind on the same path must not steal it.
    assert_eq!(Socket::server(&addr).unwrap_err(), Error::AddrInUse);

    drop(server);
    assert!(!path.exists());
}

#[test]
fn uxf_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let addr = format!("uxf:{}", dir.path().join("rt.sock").display());
    let mut server = Socket::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = Socket::connect(&client_addr).unwrap();
        conn.send(b"over-a-path").unwrap();
        assert_eq!(conn.attr_get("xcm.transport").unwrap(), AttrValue::Str("uxf".into()));
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 32];
    let n = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"over-a-path");
    client.join().unwrap();
}

#[test]
fn peer_credentials_are_observable() {
    let addr = format!("ux:{}", unique_name("creds"));
    let mut server = Socket::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = Socket::connect(&client_addr).unwrap();
        // Keep it open until the server has looked at the credentials.
        let mut buf = [0u8; 4];
        conn.receive(&mut buf).unwrap();
    });

    let mut conn = server.accept().unwrap();
    let pid = conn.attr_get("ux.peer_pid").unwrap();
    assert_eq!(pid, AttrValue::Int(i64::from(std::process::id())));
    conn.send(b"bye").unwrap();
    client.join().unwrap();
}

#[test]
fn clean_close_yields_zero_receive() {
    let addr = format!("ux:{}", unique_name("eof"));
    let mut server = Socket::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let conn = Socket::connect(&client_addr).unwrap();
        conn.close();
    });

    let mut conn = server.accept().unwrap();
    client.join().unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(conn.receive(&mut buf).unwrap(), 0);
}
