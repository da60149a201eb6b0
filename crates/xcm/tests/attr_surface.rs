//! Attribute-surface contract: typed reads and writes, writability
//! enforcement, and enumeration across the generic and transport sets.

use std::thread;

use xcm::{AttrValue, Error, Socket};

fn tcp_pair() -> (Socket, Socket) {
    let mut server = Socket::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let client = thread::spawn(move || Socket::connect(&addr).unwrap());
    let server_conn = server.accept().unwrap();
    (server_conn, client.join().unwrap())
}

#[test]
fn read_write_attributes_round_trip() {
    let (_server_conn, mut conn) = tcp_pair();

    conn.attr_set("xcm.blocking", &AttrValue::Bool(false)).unwrap();
    assert_eq!(conn.attr_get("xcm.blocking").unwrap(), AttrValue::Bool(false));
    conn.attr_set("xcm.blocking", &AttrValue::Bool(true)).unwrap();
    assert_eq!(conn.attr_get("xcm.blocking").unwrap(), AttrValue::Bool(true));

    conn.attr_set("tcp.keepalive_time", &AttrValue::Int(7)).unwrap();
    assert_eq!(conn.attr_get("tcp.keepalive_time").unwrap(), AttrValue::Int(7));

    conn.attr_set("tcp.keepalive", &AttrValue::Bool(false)).unwrap();
    assert_eq!(conn.attr_get("tcp.keepalive").unwrap(), AttrValue::Bool(false));

    conn.attr_set("tcp.user_timeout", &AttrValue::Int(30)).unwrap();
    assert_eq!(conn.attr_get("tcp.user_timeout").unwrap(), AttrValue::Int(30));
}

#[test]
fn read_only_attributes_reject_writes() {
    let (_server_conn, mut conn) = tcp_pair();

    for name in
        ["xcm.type", "xcm.transport", "xcm.local_addr", "xcm.from_app_msgs", "xcm.max_msg_size"]
    {
        assert_eq!(
            conn.attr_set(name, &AttrValue::Str("nope".into())),
            Err(Error::AccessDenied),
            "{name} accepted a write"
        );
    }
    assert_eq!(conn.attr_set("tcp.rtt", &AttrValue::Int(1)), Err(Error::AccessDenied));
}

#[test]
fn unknown_names_and_wrong_types_are_rejected() {
    let (_server_conn, mut conn) = tcp_pair();

    assert_eq!(conn.attr_get("xcm.no_such_thing"), Err(Error::NoEntry));
    assert_eq!(conn.attr_set("tcp.no_such_thing", &AttrValue::Int(1)), Err(Error::NoEntry));

    assert!(matches!(
        conn.attr_set("xcm.blocking", &AttrValue::Int(1)),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        conn.attr_set("tcp.keepalive_time", &AttrValue::Bool(true)),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn connection_attributes_are_absent_on_servers() {
    let server = Socket::server("tcp:127.0.0.1:0").unwrap();

    assert_eq!(server.attr_get("xcm.type").unwrap(), AttrValue::Str("server".into()));
    assert_eq!(server.attr_get("xcm.transport").unwrap(), AttrValue::Str("tcp".into()));
    assert_eq!(server.attr_get("xcm.max_msg_size"), Err(Error::NoEntry));
    assert_eq!(server.attr_get("xcm.from_app_msgs"), Err(Error::NoEntry));
    assert_eq!(server.attr_get("xcm.remote_addr"), Err(Error::NoEntry));
}

#[test]
fn enumeration_covers_generic_and_transport_sets() {
    let (_server_conn, conn) = tcp_pair();

    let specs = conn.attr_specs();
    let names: Vec<&str> = specs.iter().map(|s| s.name).collect();

    for expected in [
        "xcm.type",
        "xcm.transport",
        "xcm.blocking",
        "xcm.local_addr",
        "xcm.remote_addr",
        "xcm.max_msg_size",
        "xcm.from_app_msgs",
        "xcm.to_lower_bytes",
        "tcp.keepalive",
        "tcp.rtt",
    ] {
        assert!(names.contains(&expected), "{expected} missing from enumeration");
    }

    // Every spec'd attribute must be readable and carry its spec'd type.
    let mut visited = 0;
    conn.attr_visit(|name, value| {
        let spec = specs.iter().find(|s| s.name == name).unwrap();
        assert_eq!(value.ty(), spec.ty);
        visited += 1;
    });
    assert!(visited >= names.len() - 1, "most attributes should be readable");
}

#[test]
fn addresses_and_max_msg_reflect_the_connection() {
    let (server_conn, conn) = tcp_pair();

    let local = conn.attr_get("xcm.local_addr").unwrap();
    let remote = conn.attr_get("xcm.remote_addr").unwrap();
    let AttrValue::Str(local) = local else { panic!("local_addr not a string") };
    let AttrValue::Str(remote) = remote else { panic!("remote_addr not a string") };
    assert!(local.starts_with("tcp:127.0.0.1:"));
    assert_eq!(remote, server_conn.local_addr().unwrap());

    assert_eq!(
        conn.attr_get("xcm.max_msg_size").unwrap(),
        AttrValue::Int(conn.max_msg().unwrap() as i64)
    );
}
