//! Transport contract and dispatch.
//!
//! Every transport implements [`Transport`]; sockets are driven through
//! [`TpSocket`], which layers the cross-cutting concerns on top of the
//! transport calls: the control-channel tick before each application-facing
//! operation, wait-set reconciliation after it, and latching of terminal
//! errors.

pub(crate) mod stream;
pub(crate) mod tcp;
pub(crate) mod tls;
pub(crate) mod utls;
pub(crate) mod ux;

use std::sync::Mutex;

use bitflags::bitflags;
use mio::{Interest, Registry};

use crate::{
    addr,
    attr::{AttrSpec, AttrValue},
    cnt::ConnCnt,
    ctl::Ctl,
    error::{Error, Result},
    reg::{RegSet, Wakeup},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Server,
    Connection,
}

impl SocketKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Connection => "connection",
        }
    }
}

bitflags! {
    /// Application-declared interest in socket conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Condition: u32 {
        const RECEIVABLE = 1 << 0;
        const SENDABLE = 1 << 1;
        const ACCEPTABLE = 1 << 2;
    }
}

/// Process-unique socket ids, minted under a mutex.
static NEXT_SOCK_ID: Mutex<i64> = Mutex::new(0);

fn next_sock_id() -> i64 {
    let mut next = NEXT_SOCK_ID.lock().unwrap();
    let id = *next;
    *next += 1;
    id
}

/// Generic socket state shared by all transports.
pub(crate) struct SocketCore {
    pub kind: SocketKind,
    pub blocking: bool,
    pub condition: Condition,
    pub sock_id: i64,
    pub cnt: ConnCnt,
    pub reg: RegSet,
    /// Terminal error; once set, every operation repeats it.
    pub latched: Option<Error>,
    wakeup: Wakeup,
}

impl SocketCore {
    pub(crate) fn new(kind: SocketKind, registry: Registry, blocking: bool) -> Result<Self> {
        let wakeup = Wakeup::new().map_err(|e| Error::from_io(&e))?;
        Ok(Self {
            kind,
            blocking,
            condition: Condition::empty(),
            sock_id: next_sock_id(),
            cnt: ConnCnt::default(),
            reg: RegSet::new(registry),
            latched: None,
            wakeup,
        })
    }

    /// Mark the socket as able to make progress without I/O. While set,
    /// the readiness descriptor is readable.
    pub(crate) fn set_active(&mut self, active: bool) {
        let fd = self.wakeup.fd();
        self.reg.ensure(fd, active.then_some(Interest::READABLE));
    }
}

/// The per-transport operation set.
///
/// `accept` lives on the *server* transport and returns the accepted
/// connection's transport state, so no cross-transport casts are needed.
/// Sockets move between threads (with external serialization), so
/// transport state must be `Send`.
pub(crate) trait Transport: Send {
    /// Construct any state that needs the socket core (inner sockets,
    /// wakeup registrations). Runs before the attribute map is applied.
    fn init(&mut self, _core: &mut SocketCore) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, core: &mut SocketCore, addr: &str) -> Result<()>;

    fn server(&mut self, core: &mut SocketCore, addr: &str) -> Result<()>;

    fn accept(
        &mut self,
        core: &mut SocketCore,
        conn_core: &mut SocketCore,
    ) -> Result<Box<dyn Transport>>;

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()>;

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize>;

    /// Drive background work one step. `Ok(())` means idle (connects and
    /// handshakes completed, send buffers drained); `Err(WouldBlock)`
    /// means still in progress.
    fn finish(&mut self, core: &mut SocketCore) -> Result<()>;

    /// Reconcile the wait set with the current condition mask.
    fn update(&mut self, core: &mut SocketCore);

    /// Orderly release: close descriptors, signal the peer, unlink paths.
    fn close(&mut self, core: &mut SocketCore);

    /// Local-only release after fork: free resources without touching
    /// OS-level shared state (no shutdown, no unlink).
    fn cleanup(&mut self, core: &mut SocketCore) {
        self.close(core);
    }

    fn local_addr(&self) -> Option<String>;

    fn remote_addr(&self) -> Option<String> {
        None
    }

    fn set_local_addr(&mut self, _addr: &str) -> Result<()> {
        Err(Error::AccessDenied)
    }

    /// Per-connection message size ceiling.
    fn max_msg(&self) -> usize {
        0
    }

    /// Reported transport tag, when it differs from the registered
    /// protocol name. The hybrid transport masquerades as the transport
    /// its connections actually use.
    fn transport_tag(&self) -> Option<&'static str> {
        None
    }

    /// Counters backing the generic counter attributes. The hybrid
    /// transport redirects to the active inner socket.
    fn counters<'a>(&'a self, core: &'a SocketCore) -> &'a ConnCnt {
        &core.cnt
    }

    fn attr_specs(&self, _kind: SocketKind) -> Vec<AttrSpec> {
        Vec::new()
    }

    fn get_attr(&self, _core: &SocketCore, _name: &str) -> Result<AttrValue> {
        Err(Error::NoEntry)
    }

    fn set_attr(&mut self, _core: &mut SocketCore, _name: &str, _value: &AttrValue) -> Result<()> {
        Err(Error::NoEntry)
    }

    /// Hook for transports that expose inner sockets on the control
    /// directory. Returns true when the outer socket should *not* get a
    /// control listener of its own.
    fn enable_sub_ctl(&mut self) -> bool {
        false
    }
}

/// Registry entry: protocol tag and transport constructor.
pub(crate) struct Proto {
    pub name: &'static str,
    pub create: fn(SocketKind) -> Box<dyn Transport>,
}

/// All registered transports. The table is fixed at compile time;
/// tag uniqueness is asserted by a test.
pub(crate) static PROTOS: &[Proto] = &[
    Proto { name: addr::UX_PROTO, create: ux::create_ux },
    Proto { name: addr::UXF_PROTO, create: ux::create_uxf },
    Proto { name: addr::TCP_PROTO, create: tcp::create },
    Proto { name: addr::TLS_PROTO, create: tls::create },
    Proto { name: addr::UTLS_PROTO, create: utls::create },
];

pub(crate) fn proto_by_name(name: &str) -> Result<&'static Proto> {
    PROTOS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::NoTransport(name.to_string()))
}

pub(crate) fn proto_by_addr(addr: &str) -> Result<&'static Proto> {
    let (proto, _) = addr::split_proto(addr)?;
    proto_by_name(proto)
}

/// A transport bound to its generic state, with the dispatch wrappers
/// every socket operation goes through.
pub(crate) struct TpSocket {
    pub core: SocketCore,
    pub tp: Box<dyn Transport>,
    pub ctl: Option<Ctl>,
    proto: &'static Proto,
}

impl TpSocket {
    pub(crate) fn create(
        proto: &'static Proto,
        kind: SocketKind,
        registry: Registry,
        blocking: bool,
    ) -> Result<Self> {
        let mut core = SocketCore::new(kind, registry, blocking)?;
        let mut tp = (proto.create)(kind);
        tp.init(&mut core)?;
        Ok(Self { core, tp, ctl: None, proto })
    }

    pub(crate) fn transport_tag(&self) -> &'static str {
        self.tp.transport_tag().unwrap_or(self.proto.name)
    }

    pub(crate) fn counters(&self) -> &ConnCnt {
        self.tp.counters(&self.core)
    }

    /// Opportunistic control-channel servicing, run at the top of every
    /// application-facing operation.
    fn do_ctl(&mut self) {
        if let Some(mut ctl) = self.ctl.take() {
            ctl.process(self);
            self.ctl = Some(ctl);
        }
    }

    fn latched(&self) -> Result<()> {
        match &self.core.latched {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record terminal errors so they stick.
    fn note<T>(&mut self, res: &Result<T>) {
        if let Err(err) = res {
            if err.is_terminal() && self.core.latched.is_none() {
                self.core.latched = Some(err.clone());
            }
        }
    }

    pub(crate) fn connect(&mut self, addr: &str) -> Result<()> {
        self.do_ctl();
        let res = self.tp.connect(&mut self.core, addr);
        self.note(&res);
        if res.is_ok() {
            self.update();
        }
        res
    }

    pub(crate) fn server(&mut self, addr: &str) -> Result<()> {
        self.do_ctl();
        let res = self.tp.server(&mut self.core, addr);
        self.note(&res);
        if res.is_ok() {
            self.update();
        }
        res
    }

    /// Pull one pending connection off this server socket. The new
    /// socket's readiness descriptor is backed by `registry`.
    pub(crate) fn accept(&mut self, registry: Registry, blocking: bool) -> Result<Self> {
        self.do_ctl();
        let res = self.latched().and_then(|()| {
            let mut conn_core = SocketCore::new(SocketKind::Connection, registry, blocking)?;
            let tp = self.tp.accept(&mut self.core, &mut conn_core)?;
            Ok(Self { core: conn_core, tp, ctl: None, proto: self.proto })
        });
        self.note(&res);
        self.update();
        res.map(|mut conn| {
            conn.update();
            conn
        })
    }

    pub(crate) fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.do_ctl();
        let res = self.latched().and_then(|()| self.tp.send(&mut self.core, buf));
        self.note(&res);
        self.update();
        res
    }

    pub(crate) fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.do_ctl();
        let res = self.latched().and_then(|()| self.tp.receive(&mut self.core, buf));
        self.note(&res);
        self.update();
        res
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        self.do_ctl();
        let res = self.latched().and_then(|()| self.tp.finish(&mut self.core));
        self.note(&res);
        self.update();
        res
    }

    pub(crate) fn update(&mut self) {
        self.tp.update(&mut self.core);
        if self.core.latched.is_some() {
            self.core.set_active(true);
        }
    }

    pub(crate) fn enable_ctl(&mut self) {
        if !self.tp.enable_sub_ctl() {
            self.ctl = Ctl::create(&self.core);
        }
    }

    pub(crate) fn close(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            ctl.destroy(true);
        }
        self.tp.close(&mut self.core);
    }

    pub(crate) fn cleanup(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            ctl.destroy(false);
        }
        self.tp.cleanup(&mut self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_tags_are_unique() {
        for (i, p) in PROTOS.iter().enumerate() {
            assert!(
                PROTOS.iter().skip(i + 1).all(|q| q.name != p.name),
                "duplicate transport tag {}",
                p.name
            );
        }
    }

    #[test]
    fn proto_lookup() {
        assert_eq!(proto_by_name("tcp").unwrap().name, "tcp");
        assert!(matches!(proto_by_name("quic"), Err(Error::NoTransport(_))));
        assert_eq!(proto_by_addr("utls:*:0").unwrap().name, "utls");
        assert!(proto_by_addr("bare-string").is_err());
    }

    #[test]
    fn sock_ids_increase() {
        let a = next_sock_id();
        let b = next_sock_id();
        assert!(b > a);
    }
}
