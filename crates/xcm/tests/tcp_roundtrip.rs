use std::{io::Write, net::TcpStream as StdTcpStream, os::fd::RawFd, thread};

use xcm::{AttrMap, AttrValue, Condition, Error, Socket};

/// Blocking server/client connection pair over loopback.
fn tcp_pair() -> (Socket, Socket) {
    let mut server = Socket::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || Socket::connect(&addr).unwrap());
    let server_conn = server.accept().unwrap();
    (server_conn, client.join().unwrap())
}

fn poll_readable(fd: RawFd, timeout_ms: i32) {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
}

#[test]
fn roundtrip_preserves_message_boundaries() {
    let (mut server_conn, mut client_conn) = tcp_pair();
    assert_eq!(client_conn.attr_get("xcm.transport").unwrap(), AttrValue::Str("tcp".into()));

    let max_msg = client_conn.max_msg().unwrap();
    assert_eq!(max_msg, 65536);

    let messages: Vec<Vec<u8>> =
        vec![vec![0x11; 1], vec![0x22; 1000], vec![0x33; max_msg]];

    let sender = thread::spawn(move || {
        for msg in &messages {
            client_conn.send(msg).unwrap();
        }
        assert_eq!(
            client_conn.attr_get("xcm.from_app_msgs").unwrap(),
            AttrValue::Int(3)
        );
    });

    let mut buf = vec![0u8; max_msg];
    for expect_len in [1usize, 1000, max_msg] {
        let n = server_conn.receive(&mut buf).unwrap();
        assert_eq!(n, expect_len);
    }
    assert_eq!(server_conn.attr_get("xcm.to_app_msgs").unwrap(), AttrValue::Int(3));
    assert_eq!(
        server_conn.attr_get("xcm.to_app_bytes").unwrap(),
        AttrValue::Int(1 + 1000 + max_msg as i64)
    );
    sender.join().unwrap();
}

#[test]
fn oversized_send_is_rejected_and_connection_survives() {
    let (mut server_conn, mut client_conn) = tcp_pair();
    let max_msg = client_conn.max_msg().unwrap();

    let big = vec![0u8; max_msg + 1];
    assert_eq!(client_conn.send(&big), Err(Error::CapacityExceeded));
    assert_eq!(client_conn.attr_get("xcm.from_app_msgs").unwrap(), AttrValue::Int(0));

    // The connection stays usable.
    client_conn.send(b"still alive").unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(server_conn.receive(&mut buf).unwrap(), 11);
}

#[test]
fn peer_close_yields_zero_then_stays_clean() {
    let (mut server_conn, client_conn) = tcp_pair();
    client_conn.close();

    let mut buf = [0u8; 8];
    assert_eq!(server_conn.receive(&mut buf).unwrap(), 0);
}

#[test]
fn framing_violation_latches_protocol_error() {
    let mut server = Socket::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let mut raw = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut conn = server.accept().unwrap();

    // A zero frame length violates the framing contract.
    raw.write_all(&[0, 0, 0, 0]).unwrap();
    raw.flush().unwrap();

    let mut buf = [0u8; 8];
    let first = conn.receive(&mut buf).unwrap_err();
    assert!(matches!(first, Error::ProtocolError(_)));

    // Latched: identical on every subsequent operation.
    let second = conn.receive(&mut buf).unwrap_err();
    assert_eq!(first, second);
    assert_eq!(conn.send(b"x").unwrap_err(), first);
}

#[test]
fn nonblocking_connect_then_send() {
    let mut server = Socket::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let attrs = AttrMap::new().set("xcm.blocking", false);
    let mut conn = Socket::connect_with(&addr, &attrs).unwrap();
    assert!(!conn.is_blocking());

    // Send races the connect handshake; retry against the readiness
    // descriptor until the core accepts the message.
    let mut attempts = 0;
    loop {
        match conn.send(b"ping") {
            Ok(()) => break,
            Err(Error::WouldBlock) => {
                attempts += 1;
                assert!(attempts < 1000, "send never completed");
                conn.await_condition(Condition::SENDABLE).unwrap();
                poll_readable(conn.fd(), 1000);
            }
            Err(err) => panic!("send failed: {err}"),
        }
    }

    let mut server_conn = server.accept().unwrap();

    // Drive the residual until the frame has fully reached the kernel.
    let mut attempts = 0;
    loop {
        match conn.finish() {
            Ok(()) => break,
            Err(Error::WouldBlock) => {
                attempts += 1;
                assert!(attempts < 1000, "finish never completed");
                poll_readable(conn.fd(), 1000);
            }
            Err(err) => panic!("finish failed: {err}"),
        }
    }
    assert_eq!(conn.attr_get("xcm.to_lower_msgs").unwrap(), AttrValue::Int(1));

    let mut buf = [0u8; 16];
    assert_eq!(server_conn.receive(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");
}

#[test]
fn nonblocking_accept_reports_would_block() {
    let attrs = AttrMap::new().set("xcm.blocking", false);
    let mut server = Socket::server_with("tcp:127.0.0.1:0", &attrs).unwrap();
    assert_eq!(server.accept().unwrap_err(), Error::WouldBlock);
}

#[test]
fn nonblocking_receive_reports_would_block() {
    let (mut server_conn, mut client_conn) = tcp_pair();
    client_conn.set_blocking(false).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(client_conn.receive(&mut buf).unwrap_err(), Error::WouldBlock);

    // Data eventually makes the readiness descriptor readable.
    server_conn.send(b"wake").unwrap();
    client_conn.await_condition(Condition::RECEIVABLE).unwrap();

    let mut attempts = 0;
    loop {
        match client_conn.receive(&mut buf) {
            Ok(n) => {
                assert_eq!(&buf[..n], b"wake");
                break;
            }
            Err(Error::WouldBlock) => {
                attempts += 1;
                assert!(attempts < 1000, "receive never completed");
                poll_readable(client_conn.fd(), 1000);
            }
            Err(err) => panic!("receive failed: {err}"),
        }
    }
}

#[test]
fn keepalive_defaults_are_on() {
    let (_server_conn, client_conn) = tcp_pair();
    assert_eq!(client_conn.attr_get("tcp.keepalive").unwrap(), AttrValue::Bool(true));
    assert_eq!(client_conn.attr_get("tcp.user_timeout").unwrap(), AttrValue::Int(4));
}

#[test]
fn slow_reader_applies_backpressure_then_drains() {
    let (mut server_conn, mut client_conn) = tcp_pair();
    client_conn.set_blocking(false).unwrap();

    // Fill until the kernel and the single-frame send buffer push back.
    let chunk = vec![0xabu8; 32 * 1024];
    let mut queued = 0;
    loop {
        match client_conn.send(&chunk) {
            Ok(()) => queued += 1,
            Err(Error::WouldBlock) => break,
            Err(err) => panic!("send failed: {err}"),
        }
        assert!(queued < 10_000, "backpressure never engaged");
    }
    assert!(queued > 0);

    // Drain the peer while driving the sender's residual from the same
    // thread; every accepted message must come out intact.
    server_conn.set_blocking(false).unwrap();
    let mut buf = vec![0u8; 32 * 1024];
    let mut received = 0;
    let mut spins = 0u64;
    while received < queued {
        let _ = client_conn.finish();
        match server_conn.receive(&mut buf) {
            Ok(n) => {
                assert_eq!(n, chunk.len());
                received += 1;
            }
            Err(Error::WouldBlock) => {
                spins += 1;
                assert!(spins < 10_000_000, "drain stalled");
                thread::yield_now();
            }
            Err(err) => panic!("receive failed: {err}"),
        }
    }

    // With the backlog gone, the sender unblocks.
    let mut attempts = 0;
    loop {
        match client_conn.send(&chunk) {
            Ok(()) => break,
            Err(Error::WouldBlock) => {
                attempts += 1;
                assert!(attempts < 1000, "sender never unblocked");
                let _ = client_conn.finish();
                poll_readable(client_conn.fd(), 100);
            }
            Err(err) => panic!("send failed: {err}"),
        }
    }
}
