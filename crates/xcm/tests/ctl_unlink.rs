//! Control-socket filesystem entries come and go with their socket.

use once_cell::sync::Lazy;
use xcm::{Socket, list_ctl_sockets};

static CTL_DIR: Lazy<tempfile::TempDir> = Lazy::new(|| {
    let dir = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var("XCM_CTL", dir.path()) };
    dir
});

#[test]
fn control_socket_is_unlinked_on_close() {
    Lazy::force(&CTL_DIR);
    let pid = std::process::id();
    let ids = || -> Vec<i64> {
        list_ctl_sockets()
            .unwrap()
            .into_iter()
            .filter_map(|(p, id)| (p == pid).then_some(id))
            .collect()
    };

    assert!(ids().is_empty());

    let server = Socket::server(&format!("ux:xcm-test-ctl-unlink-{pid}")).unwrap();
    assert_eq!(ids().len(), 1);

    drop(server);
    assert!(ids().is_empty());
}
