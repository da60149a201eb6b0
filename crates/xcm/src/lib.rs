//! Connection-oriented, message-preserving messaging sockets with a
//! uniform API over several underlying transports.
//!
//! Applications bind a server socket to a named address
//! (`"utls:*:4711"`, `"tcp:10.0.0.1:4711"`, `"ux:my-service"`, ...),
//! connect from clients, and exchange discrete byte-string messages in
//! both directions. All transports share the same semantics: reliable,
//! in-order delivery with message boundaries preserved.
//!
//! Sockets are blocking by default. In non-blocking mode every call
//! returns promptly with [`Error::WouldBlock`] when it cannot progress;
//! the application then declares its interest with
//! [`Socket::await_condition`] and waits for the socket's readiness
//! descriptor ([`Socket::fd`]) in its own event loop, calling
//! [`Socket::finish`] to drive background work.
//!
//! ```no_run
//! use xcm::Socket;
//!
//! let mut server = Socket::server("utls:*:4711")?;
//! let mut conn = server.accept()?;
//! let mut buf = [0u8; 65536];
//! let len = conn.receive(&mut buf)?;
//! conn.send(&buf[..len])?;
//! # Ok::<(), xcm::Error>(())
//! ```

mod addr;
mod attr;
mod cert;
mod cnt;
mod ctl;
mod error;
mod reg;
mod tp;

use std::os::fd::{AsRawFd, RawFd};

use mio::{Events, Poll};
use tracing::debug;

pub use crate::{
    attr::{AttrMap, AttrSpec, AttrType, AttrValue},
    cnt::{Cnt, ConnCnt},
    ctl::{CtlClient, ctl_dir, list_ctl_sockets},
    error::{Error, Result},
    tp::{Condition, SocketKind},
};
use crate::tp::TpSocket;

/// A server or connection socket.
///
/// Server sockets accept inbound connections and carry no message data;
/// connection sockets carry messages in both directions. A socket is not
/// re-entrant: sharing one across concurrent accessors requires external
/// serialization.
pub struct Socket {
    poll: Poll,
    events: Events,
    inner: TpSocket,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

impl Socket {
    fn create(proto: &'static tp::Proto, kind: SocketKind, blocking: bool) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::from_io(&e))?;
        let registry = poll.registry().try_clone().map_err(|e| Error::from_io(&e))?;
        let inner = TpSocket::create(proto, kind, registry, blocking)?;
        Ok(Self { poll, events: Events::with_capacity(8), inner })
    }

    fn apply_attrs(&mut self, attrs: &AttrMap) -> Result<()> {
        for (name, value) in attrs.iter() {
            attr::set(&mut self.inner, name, value)?;
        }
        Ok(())
    }

    /// Connect to a remote server socket. Blocks until the connection is
    /// established unless `xcm.blocking` is false.
    pub fn connect(remote_addr: &str) -> Result<Self> {
        Self::connect_with(remote_addr, &AttrMap::new())
    }

    /// [`connect`](Self::connect) with an attribute map, applied in
    /// order before the connect is initiated.
    pub fn connect_with(remote_addr: &str, attrs: &AttrMap) -> Result<Self> {
        let proto = tp::proto_by_addr(remote_addr)?;
        let mut sock = Self::create(proto, SocketKind::Connection, true)?;
        sock.apply_attrs(attrs)?;
        sock.inner.connect(remote_addr)?;
        sock.inner.enable_ctl();
        if sock.inner.core.blocking {
            sock.finish_blocking()?;
        }
        Ok(sock)
    }

    /// Bind a server socket to a local address and start listening.
    pub fn server(local_addr: &str) -> Result<Self> {
        Self::server_with(local_addr, &AttrMap::new())
    }

    /// [`server`](Self::server) with an attribute map.
    pub fn server_with(local_addr: &str, attrs: &AttrMap) -> Result<Self> {
        let proto = tp::proto_by_addr(local_addr)?;
        let mut sock = Self::create(proto, SocketKind::Server, true)?;
        sock.apply_attrs(attrs)?;
        sock.inner.server(local_addr)?;
        sock.inner.enable_ctl();
        Ok(sock)
    }

    /// Accept one pending connection. The new socket inherits this
    /// socket's blocking mode.
    pub fn accept(&mut self) -> Result<Self> {
        self.accept_with(&AttrMap::new())
    }

    /// [`accept`](Self::accept) with an attribute map applied to the
    /// accepted connection.
    pub fn accept_with(&mut self, attrs: &AttrMap) -> Result<Self> {
        if self.inner.core.kind != SocketKind::Server {
            return Err(Error::InvalidInput("accept on a connection socket".into()));
        }

        loop {
            let poll = Poll::new().map_err(|e| Error::from_io(&e))?;
            let registry = poll.registry().try_clone().map_err(|e| Error::from_io(&e))?;

            match self.inner.accept(registry, self.inner.core.blocking) {
                Ok(inner) => {
                    let mut conn = Self { poll, events: Events::with_capacity(8), inner };
                    conn.apply_attrs(attrs)?;
                    conn.inner.enable_ctl();
                    if conn.inner.core.blocking {
                        conn.finish_blocking()?;
                    }
                    return Ok(conn);
                }
                Err(Error::WouldBlock) if self.inner.core.blocking => {
                    self.wait_with(Condition::ACCEPTABLE)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send one message. In non-blocking mode the message has been
    /// accepted by the core when this returns; delivery to the OS may
    /// still be in progress.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        if self.inner.core.kind != SocketKind::Connection {
            return Err(Error::InvalidInput("send on a server socket".into()));
        }
        if !self.inner.core.blocking {
            return self.inner.send(buf);
        }
        loop {
            match self.inner.send(buf) {
                Err(Error::WouldBlock) => self.wait_with(Condition::SENDABLE)?,
                res => return res,
            }
        }
    }

    /// Receive one message into `buf`, truncating if the message is
    /// larger than the buffer. Returns the number of bytes delivered;
    /// zero means the peer closed the connection cleanly.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.core.kind != SocketKind::Connection {
            return Err(Error::InvalidInput("receive on a server socket".into()));
        }
        if !self.inner.core.blocking {
            return self.inner.receive(buf);
        }
        loop {
            match self.inner.receive(buf) {
                Err(Error::WouldBlock) => self.wait_with(Condition::RECEIVABLE)?,
                res => return res,
            }
        }
    }

    /// Drive background work (connect completion, handshakes, send-buffer
    /// drain). In non-blocking mode, returns [`Error::WouldBlock`] while
    /// work remains.
    pub fn finish(&mut self) -> Result<()> {
        if self.inner.core.blocking { self.finish_blocking() } else { self.inner.finish() }
    }

    /// Declare which conditions the application is waiting for. The
    /// readiness descriptor becomes readable when one of them is likely
    /// satisfied or background work can progress.
    pub fn await_condition(&mut self, condition: Condition) -> Result<()> {
        let valid = match self.inner.core.kind {
            SocketKind::Server => Condition::ACCEPTABLE,
            SocketKind::Connection => Condition::RECEIVABLE | Condition::SENDABLE,
        };
        if !valid.contains(condition) {
            return Err(Error::InvalidInput(format!(
                "condition {condition:?} invalid for a {} socket",
                self.inner.core.kind.name()
            )));
        }
        self.inner.core.condition = condition;
        self.inner.update();
        Ok(())
    }

    /// The socket's readiness descriptor, for use with poll/epoll/select.
    /// Stable for the socket's lifetime.
    pub fn fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        attr::set(&mut self.inner, "xcm.blocking", &AttrValue::Bool(blocking))
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.core.blocking
    }

    pub fn local_addr(&self) -> Result<String> {
        self.inner.tp.local_addr().ok_or(Error::NoEntry)
    }

    pub fn remote_addr(&self) -> Result<String> {
        self.inner.tp.remote_addr().ok_or(Error::NoEntry)
    }

    /// Largest message this connection will carry.
    pub fn max_msg(&self) -> Result<usize> {
        if self.inner.core.kind != SocketKind::Connection {
            return Err(Error::InvalidInput("max_msg on a server socket".into()));
        }
        Ok(self.inner.tp.max_msg())
    }

    /// Read one attribute by name.
    pub fn attr_get(&self, name: &str) -> Result<AttrValue> {
        attr::get(&self.inner, name)
    }

    /// Write one attribute by name.
    pub fn attr_set(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        attr::set(&mut self.inner, name, value)
    }

    /// Specs of every attribute this socket carries.
    pub fn attr_specs(&self) -> Vec<AttrSpec> {
        attr::specs(&self.inner)
    }

    /// Visit every readable attribute.
    pub fn attr_visit(&self, mut f: impl FnMut(&str, &AttrValue)) {
        attr::visit_all(&self.inner, &mut f);
    }

    /// Orderly close: releases OS resources and signals the peer.
    /// Dropping the socket has the same effect.
    pub fn close(self) {}

    /// Local-only release, for the non-owning side after a process fork:
    /// frees process-local resources without signaling the peer or
    /// unlinking shared filesystem entries.
    pub fn cleanup(mut self) {
        self.inner.cleanup();
    }

    fn finish_blocking(&mut self) -> Result<()> {
        loop {
            match self.inner.finish() {
                Err(Error::WouldBlock) => self.poll_wait()?,
                res => return res,
            }
        }
    }

    /// Wait on the readiness descriptor with a temporary condition mask.
    fn wait_with(&mut self, condition: Condition) -> Result<()> {
        let saved = self.inner.core.condition;
        self.inner.core.condition = condition;
        self.inner.update();

        let res = self.poll_wait();

        self.inner.core.condition = saved;
        self.inner.update();
        res
    }

    fn poll_wait(&mut self) -> Result<()> {
        debug!(sock_id = self.inner.core.sock_id, "waiting on readiness descriptor");
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Err(Error::Interrupted),
            Err(e) => Err(Error::from_io(&e)),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.inner.close();
    }
}
