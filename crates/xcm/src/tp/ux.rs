//! UX and UXF transports: connection-oriented, message-preserving local
//! sockets (`AF_UNIX`/`SOCK_SEQPACKET`).
//!
//! UX names live in the abstract namespace, so server addresses disappear
//! with the process. UXF uses filesystem paths and unlinks them on close.
//! One OS message is one XCM message; no framing layer is involved.

use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
};

use mio::Interest;
use tracing::debug;

use crate::{
    addr,
    attr::{AttrSpec, AttrType, AttrValue},
    error::{Error, Result},
    tp::{Condition, SocketCore, SocketKind, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UxNamespace {
    /// Abstract socket namespace (UX).
    Abstract,
    /// Filesystem paths (UXF).
    Path,
}

impl UxNamespace {
    fn proto(self) -> &'static str {
        match self {
            Self::Abstract => addr::UX_PROTO,
            Self::Path => addr::UXF_PROTO,
        }
    }
}

pub(crate) fn create_ux(_kind: SocketKind) -> Box<dyn Transport> {
    Box::new(UxTransport::new(UxNamespace::Abstract))
}

pub(crate) fn create_uxf(_kind: SocketKind) -> Box<dyn Transport> {
    Box::new(UxTransport::new(UxNamespace::Path))
}

enum UxState {
    Init,
    Conn { fd: OwnedFd, remote: Option<String>, max_msg: usize },
    Server { fd: OwnedFd, local: String, unlink_path: Option<PathBuf> },
    Closed,
}

pub(crate) struct UxTransport {
    ns: UxNamespace,
    state: UxState,
}

impl UxTransport {
    pub(crate) fn new(ns: UxNamespace) -> Self {
        Self { ns, state: UxState::Init }
    }

    fn conn_fd(&self) -> Result<RawFd> {
        match &self.state {
            UxState::Conn { fd, .. } => Ok(fd.as_raw_fd()),
            _ => Err(Error::InvalidInput("not a connection in progress".into())),
        }
    }

    fn tail<'a>(&self, full_addr: &'a str) -> Result<&'a str> {
        let (proto, tail) = addr::split_proto(full_addr)?;
        if proto != self.ns.proto() || tail.is_empty() {
            return Err(Error::InvalidInput(format!("bad {} address \"{full_addr}\"", self.ns.proto())));
        }
        Ok(tail)
    }
}

pub(crate) fn seqpacket_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sun_path_offset(sa: &libc::sockaddr_un) -> usize {
    let base = sa as *const libc::sockaddr_un as usize;
    sa.sun_path.as_ptr() as usize - base
}

pub(crate) fn sockaddr_un(
    ns: UxNamespace,
    name: &str,
) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = name.as_bytes();
    let cap = sa.sun_path.len();
    let offset = sun_path_offset(&sa);

    let len = match ns {
        UxNamespace::Abstract => {
            if bytes.len() + 1 > cap {
                return Err(Error::InvalidInput(format!("ux name \"{name}\" too long")));
            }
            for (dst, src) in sa.sun_path[1..].iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            offset + 1 + bytes.len()
        }
        UxNamespace::Path => {
            if bytes.len() + 1 > cap {
                return Err(Error::InvalidInput(format!("uxf path \"{name}\" too long")));
            }
            for (dst, src) in sa.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            offset + bytes.len() + 1
        }
    };

    Ok((sa, len as libc::socklen_t))
}

/// Decode a peer/local sockaddr back into a name.
fn sockaddr_name(sa: &libc::sockaddr_un, len: libc::socklen_t) -> Option<(UxNamespace, String)> {
    let offset = sun_path_offset(sa);
    let path_len = (len as usize).checked_sub(offset)?;
    if path_len == 0 {
        return None;
    }
    let raw: Vec<u8> = sa.sun_path[..path_len].iter().map(|c| *c as u8).collect();
    if raw[0] == 0 {
        Some((UxNamespace::Abstract, String::from_utf8_lossy(&raw[1..]).into_owned()))
    } else {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Some((UxNamespace::Path, String::from_utf8_lossy(&raw[..end]).into_owned()))
    }
}

fn enable_passcred(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&one as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sndbuf_size(fd: RawFd) -> usize {
    let mut size: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&mut size as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 || size <= 0 {
        // Kernel default for AF_UNIX if the query fails.
        return 208 * 1024;
    }
    size as usize
}

fn peer_creds(fd: RawFd) -> Result<libc::ucred> {
    let mut creds: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut creds as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::from_io(&io::Error::last_os_error()));
    }
    Ok(creds)
}

fn connect_errno(errno: i32) -> Error {
    match errno {
        // A missing local endpoint is reported immediately, even for a
        // non-blocking connect. A full backlog looks the same to callers.
        libc::ECONNREFUSED | libc::ENOENT | libc::EAGAIN => Error::ConnectionRefused,
        libc::EACCES | libc::EPERM => Error::AccessDenied,
        other => Error::from_errno(other),
    }
}

impl Transport for UxTransport {
    fn connect(&mut self, _core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let name = self.tail(remote_addr)?;
        debug!(addr = remote_addr, "ux connect");

        let fd = seqpacket_socket().map_err(|e| Error::from_io(&e))?;
        enable_passcred(fd.as_raw_fd()).map_err(|e| Error::from_io(&e))?;

        let (sa, sa_len) = sockaddr_un(self.ns, name)?;
        let rc = unsafe {
            libc::connect(fd.as_raw_fd(), (&sa as *const libc::sockaddr_un).cast(), sa_len)
        };
        if rc < 0 {
            return Err(connect_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }

        let max_msg = sndbuf_size(fd.as_raw_fd());
        self.state = UxState::Conn { fd, remote: Some(remote_addr.to_string()), max_msg };
        Ok(())
    }

    fn server(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        let name = self.tail(local_addr)?;
        debug!(addr = local_addr, "ux server");

        let fd = seqpacket_socket().map_err(|e| Error::from_io(&e))?;
        let (sa, sa_len) = sockaddr_un(self.ns, name)?;

        let rc =
            unsafe { libc::bind(fd.as_raw_fd(), (&sa as *const libc::sockaddr_un).cast(), sa_len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EADDRINUSE) => Error::AddrInUse,
                Some(libc::EACCES | libc::EPERM) => Error::AccessDenied,
                _ => Error::from_io(&err),
            });
        }

        let unlink_path =
            (self.ns == UxNamespace::Path).then(|| PathBuf::from(name));

        if unsafe { libc::listen(fd.as_raw_fd(), 32) } < 0 {
            let err = Error::from_io(&io::Error::last_os_error());
            if let Some(path) = &unlink_path {
                let _ = std::fs::remove_file(path);
            }
            return Err(err);
        }

        self.state = UxState::Server { fd, local: local_addr.to_string(), unlink_path };
        Ok(())
    }

    fn accept(
        &mut self,
        _core: &mut SocketCore,
        _conn_core: &mut SocketCore,
    ) -> Result<Box<dyn Transport>> {
        let UxState::Server { fd, .. } = &self.state else {
            return Err(Error::InvalidInput("not a server socket".into()));
        };

        let conn_fd = unsafe {
            libc::accept4(
                fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn_fd < 0 {
            let err = io::Error::last_os_error();
            return Err(Error::from_io(&err));
        }
        let conn_fd = unsafe { OwnedFd::from_raw_fd(conn_fd) };
        let _ = enable_passcred(conn_fd.as_raw_fd());

        let remote = {
            let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
            let rc = unsafe {
                libc::getpeername(
                    conn_fd.as_raw_fd(),
                    (&mut sa as *mut libc::sockaddr_un).cast(),
                    &mut len,
                )
            };
            (rc == 0)
                .then(|| sockaddr_name(&sa, len))
                .flatten()
                .map(|(ns, name)| format!("{}:{name}", ns.proto()))
        };

        let max_msg = sndbuf_size(conn_fd.as_raw_fd());
        Ok(Box::new(Self {
            ns: self.ns,
            state: UxState::Conn { fd: conn_fd, remote, max_msg },
        }))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        let UxState::Conn { fd, max_msg, .. } = &self.state else {
            return Err(Error::InvalidInput("not a connection socket".into()));
        };
        if buf.is_empty() {
            return Err(Error::InvalidInput("zero-length message".into()));
        }
        if buf.len() > *max_msg {
            return Err(Error::CapacityExceeded);
        }

        let rc = unsafe {
            libc::send(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EAGAIN) => Error::WouldBlock,
                Some(libc::EPIPE | libc::ECONNRESET) => Error::ConnectionReset,
                _ => Error::from_io(&err),
            });
        }

        // One OS message is one XCM message: it crosses both boundaries
        // at once.
        core.cnt.msg_from_app(buf.len());
        core.cnt.msg_to_lower(buf.len());
        Ok(())
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        let fd = self.conn_fd()?;

        let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EAGAIN) => Error::WouldBlock,
                Some(libc::ECONNRESET) => Error::ConnectionReset,
                _ => Error::from_io(&err),
            });
        }
        if rc == 0 {
            // Zero-length messages are forbidden, so this is the peer
            // closing cleanly.
            return Ok(0);
        }

        let n = rc as usize;
        core.cnt.msg_to_app(n);
        Ok(n)
    }

    fn finish(&mut self, _core: &mut SocketCore) -> Result<()> {
        // No deferred work: local connects complete synchronously.
        Ok(())
    }

    fn update(&mut self, core: &mut SocketCore) {
        match &self.state {
            UxState::Conn { fd, .. } => {
                let mut interest = None;
                if core.condition.contains(Condition::RECEIVABLE) {
                    interest = Some(Interest::READABLE);
                }
                if core.condition.contains(Condition::SENDABLE) {
                    interest =
                        Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                core.reg.ensure(fd.as_raw_fd(), interest);
            }
            UxState::Server { fd, .. } => {
                let interest = core
                    .condition
                    .contains(Condition::ACCEPTABLE)
                    .then_some(Interest::READABLE);
                core.reg.ensure(fd.as_raw_fd(), interest);
            }
            UxState::Init | UxState::Closed => {}
        }
    }

    fn close(&mut self, core: &mut SocketCore) {
        core.reg.clear();
        if let UxState::Server { unlink_path: Some(path), .. } = &self.state {
            let _ = std::fs::remove_file(path);
        }
        self.state = UxState::Closed;
    }

    fn cleanup(&mut self, core: &mut SocketCore) {
        // Fork loser path: drop descriptors, leave filesystem entries to
        // the owner.
        core.reg.clear();
        self.state = UxState::Closed;
    }

    fn local_addr(&self) -> Option<String> {
        match &self.state {
            UxState::Server { local, .. } => Some(local.clone()),
            _ => None,
        }
    }

    fn remote_addr(&self) -> Option<String> {
        match &self.state {
            UxState::Conn { remote, .. } => remote.clone(),
            _ => None,
        }
    }

    fn max_msg(&self) -> usize {
        match &self.state {
            UxState::Conn { max_msg, .. } => *max_msg,
            _ => 0,
        }
    }

    fn attr_specs(&self, kind: SocketKind) -> Vec<AttrSpec> {
        match kind {
            SocketKind::Connection => vec![
                AttrSpec::ro("ux.peer_pid", AttrType::Int),
                AttrSpec::ro("ux.peer_uid", AttrType::Int),
                AttrSpec::ro("ux.peer_gid", AttrType::Int),
            ],
            SocketKind::Server => Vec::new(),
        }
    }

    fn get_attr(&self, _core: &SocketCore, name: &str) -> Result<AttrValue> {
        let fd = match (&self.state, name) {
            (UxState::Conn { fd, .. }, "ux.peer_pid" | "ux.peer_uid" | "ux.peer_gid") => {
                fd.as_raw_fd()
            }
            _ => return Err(Error::NoEntry),
        };
        let creds = peer_creds(fd)?;
        let value = match name {
            "ux.peer_pid" => i64::from(creds.pid),
            "ux.peer_uid" => i64::from(creds.uid),
            _ => i64::from(creds.gid),
        };
        Ok(AttrValue::Int(value))
    }
}
