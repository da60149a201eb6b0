//! TCP transport: the framed-stream engine over a non-blocking
//! `mio::net::TcpStream`.
//!
//! Keepalive is on by default so dead peers on idle connections are
//! detected; Nagle is disabled to keep signaling latency down. The
//! keepalive/user-timeout knobs are exposed as read-write attributes and
//! shared with the TLS transport.

use std::{
    io, mem,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use mio::{
    Interest,
    net::{TcpListener, TcpStream},
};
use tracing::debug;

use crate::{
    addr::{self, HostPort},
    attr::{AttrSpec, AttrType, AttrValue},
    error::{Error, Result},
    tp::{
        Condition, SocketCore, SocketKind, Transport,
        stream::{FramedSession, RecvStatus},
    },
};

pub(crate) const TCP_MAX_MSG: usize = 65536;

pub(crate) fn create(_kind: SocketKind) -> Box<dyn Transport> {
    Box::new(TcpTransport::new())
}

/// Kernel-level liveness options, in seconds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpOpts {
    pub keepalive: bool,
    pub keepalive_time: i64,
    pub keepalive_interval: i64,
    pub keepalive_count: i64,
    pub user_timeout: i64,
}

impl Default for TcpOpts {
    fn default() -> Self {
        // Aggressive defaults for signaling workloads: an unresponsive
        // peer is declared dead after time + interval * count.
        Self {
            keepalive: true,
            keepalive_time: 1,
            keepalive_interval: 1,
            keepalive_count: 3,
            user_timeout: 4,
        }
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn apply_opts(fd: RawFd, opts: &TcpOpts) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, opts.keepalive as libc::c_int)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, opts.keepalive_time as libc::c_int)?;
    setsockopt_int(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPINTVL,
        opts.keepalive_interval as libc::c_int,
    )?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, opts.keepalive_count as libc::c_int)?;
    setsockopt_int(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_USER_TIMEOUT,
        (opts.user_timeout * 1000) as libc::c_int,
    )
}

fn tcp_info(fd: RawFd) -> io::Result<libc::tcp_info> {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            (&mut info as *mut libc::tcp_info).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(info)
}

/// The TCP option attribute set, shared verbatim by the TLS transport.
pub(crate) fn opt_attr_specs() -> Vec<AttrSpec> {
    vec![
        AttrSpec::rw("tcp.keepalive", AttrType::Bool),
        AttrSpec::rw("tcp.keepalive_time", AttrType::Int),
        AttrSpec::rw("tcp.keepalive_interval", AttrType::Int),
        AttrSpec::rw("tcp.keepalive_count", AttrType::Int),
        AttrSpec::rw("tcp.user_timeout", AttrType::Int),
        AttrSpec::ro("tcp.rtt", AttrType::Int),
        AttrSpec::ro("tcp.total_retrans", AttrType::Int),
    ]
}

pub(crate) fn opt_get_attr(opts: &TcpOpts, fd: Option<RawFd>, name: &str) -> Result<AttrValue> {
    let value = match name {
        "tcp.keepalive" => return Ok(AttrValue::Bool(opts.keepalive)),
        "tcp.keepalive_time" => opts.keepalive_time,
        "tcp.keepalive_interval" => opts.keepalive_interval,
        "tcp.keepalive_count" => opts.keepalive_count,
        "tcp.user_timeout" => opts.user_timeout,
        "tcp.rtt" | "tcp.total_retrans" => {
            let fd = fd.ok_or(Error::NoEntry)?;
            let info = tcp_info(fd).map_err(|e| Error::from_io(&e))?;
            if name == "tcp.rtt" {
                i64::from(info.tcpi_rtt)
            } else {
                i64::from(info.tcpi_total_retrans)
            }
        }
        _ => return Err(Error::NoEntry),
    };
    Ok(AttrValue::Int(value))
}

pub(crate) fn opt_set_attr(
    opts: &mut TcpOpts,
    fd: Option<RawFd>,
    name: &str,
    value: &AttrValue,
) -> Result<()> {
    let expect_int = || value.as_int().ok_or_else(|| Error::InvalidInput("expected int".into()));
    match name {
        "tcp.keepalive" => {
            opts.keepalive =
                value.as_bool().ok_or_else(|| Error::InvalidInput("expected bool".into()))?;
        }
        "tcp.keepalive_time" => opts.keepalive_time = expect_int()?,
        "tcp.keepalive_interval" => opts.keepalive_interval = expect_int()?,
        "tcp.keepalive_count" => opts.keepalive_count = expect_int()?,
        "tcp.user_timeout" => opts.user_timeout = expect_int()?,
        "tcp.rtt" | "tcp.total_retrans" => return Err(Error::AccessDenied),
        _ => return Err(Error::NoEntry),
    }
    if let Some(fd) = fd {
        apply_opts(fd, opts).map_err(|e| Error::from_io(&e))?;
    }
    Ok(())
}

/// Parse and resolve the `host:port` tail of an IP-transport address.
pub(crate) fn resolve_tail(proto: &'static str, full_addr: &str) -> Result<(HostPort, SocketAddr)> {
    let (p, tail) = addr::split_proto(full_addr)?;
    if p != proto {
        return Err(Error::InvalidInput(format!("bad {proto} address \"{full_addr}\"")));
    }
    let hp = HostPort::parse(tail)?;
    let sa = hp.resolve()?;
    Ok((hp, sa))
}

/// Non-blocking connect progress check: writable after `connect` means
/// either an established connection (peer address is known) or a
/// deferred failure surfaced via `SO_ERROR`.
pub(crate) fn connect_progress(stream: &TcpStream) -> Result<bool> {
    if let Some(err) = stream.take_error().map_err(|e| Error::from_io(&e))? {
        return Err(Error::from_io(&err));
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e)
            if e.kind() == io::ErrorKind::NotConnected ||
                e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            Ok(false)
        }
        Err(e) => Err(Error::from_io(&e)),
    }
}

enum TcpState {
    Init,
    Connecting { stream: TcpStream },
    Conn { stream: TcpStream, session: FramedSession },
    Server { listener: TcpListener, local: SocketAddr },
    Closed,
}

pub(crate) struct TcpTransport {
    state: TcpState,
    opts: TcpOpts,
}

impl TcpTransport {
    pub(crate) fn new() -> Self {
        Self { state: TcpState::Init, opts: TcpOpts::default() }
    }

    fn fd(&self) -> Option<RawFd> {
        match &self.state {
            TcpState::Connecting { stream } | TcpState::Conn { stream, .. } => {
                Some(stream.as_raw_fd())
            }
            TcpState::Server { listener, .. } => Some(listener.as_raw_fd()),
            TcpState::Init | TcpState::Closed => None,
        }
    }

    /// Promote `Connecting` to `Conn` if the handshake finished.
    /// Returns whether the connection is established.
    fn drive_connect(&mut self) -> Result<bool> {
        match &self.state {
            TcpState::Connecting { stream } => {
                if !connect_progress(stream)? {
                    return Ok(false);
                }
                debug!("tcp connect completed");
                let TcpState::Connecting { stream } = mem::replace(&mut self.state, TcpState::Init)
                else {
                    unreachable!();
                };
                self.state =
                    TcpState::Conn { stream, session: FramedSession::new(TCP_MAX_MSG) };
                Ok(true)
            }
            TcpState::Conn { .. } => Ok(true),
            _ => Err(Error::InvalidInput("not a connection socket".into())),
        }
    }

    fn conn_mut(&mut self) -> Result<(&mut TcpStream, &mut FramedSession)> {
        match &mut self.state {
            TcpState::Conn { stream, session } => Ok((stream, session)),
            _ => Err(Error::WouldBlock),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, _core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let (_, sa) = resolve_tail(addr::TCP_PROTO, remote_addr)?;
        debug!(addr = remote_addr, "tcp connect");

        let stream = TcpStream::connect(sa).map_err(|e| Error::from_io(&e))?;
        apply_opts(stream.as_raw_fd(), &self.opts).map_err(|e| Error::from_io(&e))?;

        self.state = TcpState::Connecting { stream };
        Ok(())
    }

    fn server(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        let (_, sa) = resolve_tail(addr::TCP_PROTO, local_addr)?;
        debug!(addr = local_addr, "tcp server");

        let listener = TcpListener::bind(sa).map_err(|e| Error::from_io(&e))?;
        let local = listener.local_addr().map_err(|e| Error::from_io(&e))?;
        self.state = TcpState::Server { listener, local };
        Ok(())
    }

    fn accept(
        &mut self,
        _core: &mut SocketCore,
        _conn_core: &mut SocketCore,
    ) -> Result<Box<dyn Transport>> {
        let TcpState::Server { listener, .. } = &self.state else {
            return Err(Error::InvalidInput("not a server socket".into()));
        };

        let (stream, peer) = listener.accept().map_err(|e| Error::from_io(&e))?;
        debug!(?peer, "tcp accepted");
        apply_opts(stream.as_raw_fd(), &self.opts).map_err(|e| Error::from_io(&e))?;

        Ok(Box::new(Self {
            state: TcpState::Conn { stream, session: FramedSession::new(TCP_MAX_MSG) },
            opts: self.opts,
        }))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        if !self.drive_connect()? {
            return Err(Error::WouldBlock);
        }
        let (stream, session) = self.conn_mut()?;

        // Drain any residual frame first; a completed drain is the
        // moment the previous message reached the lower layer.
        if session.sending() {
            if let Some(payload) = session.drive_send(stream)? {
                core.cnt.msg_to_lower(payload);
            }
        }

        session.enqueue(buf)?;
        core.cnt.msg_from_app(buf.len());

        if let Some(payload) = session.drive_send(stream)? {
            core.cnt.msg_to_lower(payload);
        }
        Ok(())
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        if !self.drive_connect()? {
            return Err(Error::WouldBlock);
        }
        let (stream, session) = self.conn_mut()?;

        // Residual send progress rides along on receive calls.
        if session.sending() {
            if let Some(payload) = session.drive_send(stream)? {
                core.cnt.msg_to_lower(payload);
            }
        }

        match session.drive_recv(stream)? {
            RecvStatus::MsgReady => {
                let n = session.take_msg(buf);
                core.cnt.msg_to_app(n);
                Ok(n)
            }
            RecvStatus::Pending => Err(Error::WouldBlock),
            RecvStatus::Eof => Ok(0),
        }
    }

    fn finish(&mut self, core: &mut SocketCore) -> Result<()> {
        match &self.state {
            TcpState::Server { .. } => return Ok(()),
            TcpState::Init | TcpState::Closed => return Ok(()),
            _ => {}
        }

        if !self.drive_connect()? {
            return Err(Error::WouldBlock);
        }
        let (stream, session) = self.conn_mut()?;

        if session.sending() {
            match session.drive_send(stream)? {
                Some(payload) => core.cnt.msg_to_lower(payload),
                None => return Err(Error::WouldBlock),
            }
        }

        // One opportunistic receive step; anything it assembles waits in
        // the session buffer for the next receive call.
        if !session.msg_ready() {
            let _ = session.drive_recv(stream)?;
        }
        Ok(())
    }

    fn update(&mut self, core: &mut SocketCore) {
        match &self.state {
            TcpState::Connecting { stream } => {
                core.reg.ensure(stream.as_raw_fd(), Some(Interest::WRITABLE));
                core.set_active(false);
            }
            TcpState::Conn { stream, session } => {
                let mut interest = None;
                let want_read = (core.condition.contains(Condition::RECEIVABLE) &&
                    !session.msg_ready()) ||
                    session.recv_in_progress();
                if want_read {
                    interest = Some(Interest::READABLE);
                }
                if session.sending() || core.condition.contains(Condition::SENDABLE) {
                    interest =
                        Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                core.reg.ensure(stream.as_raw_fd(), interest);

                let immediate = (core.condition.contains(Condition::RECEIVABLE) &&
                    session.msg_ready()) ||
                    session.check().is_err();
                core.set_active(immediate);
            }
            TcpState::Server { listener, .. } => {
                let interest =
                    core.condition.contains(Condition::ACCEPTABLE).then_some(Interest::READABLE);
                core.reg.ensure(listener.as_raw_fd(), interest);
            }
            TcpState::Init | TcpState::Closed => {}
        }
    }

    fn close(&mut self, core: &mut SocketCore) {
        core.reg.clear();
        self.state = TcpState::Closed;
    }

    fn local_addr(&self) -> Option<String> {
        match &self.state {
            TcpState::Server { local, .. } => Some(addr::format_socket_addr(addr::TCP_PROTO, local)),
            TcpState::Conn { stream, .. } => stream
                .local_addr()
                .ok()
                .map(|sa| addr::format_socket_addr(addr::TCP_PROTO, &sa)),
            _ => None,
        }
    }

    fn remote_addr(&self) -> Option<String> {
        match &self.state {
            TcpState::Conn { stream, .. } => stream
                .peer_addr()
                .ok()
                .map(|sa| addr::format_socket_addr(addr::TCP_PROTO, &sa)),
            _ => None,
        }
    }

    fn max_msg(&self) -> usize {
        TCP_MAX_MSG
    }

    fn attr_specs(&self, kind: SocketKind) -> Vec<AttrSpec> {
        match kind {
            SocketKind::Connection => opt_attr_specs(),
            SocketKind::Server => Vec::new(),
        }
    }

    fn get_attr(&self, _core: &SocketCore, name: &str) -> Result<AttrValue> {
        opt_get_attr(&self.opts, self.fd(), name)
    }

    fn set_attr(&mut self, _core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        let fd = self.fd();
        opt_set_attr(&mut self.opts, fd, name, value)
    }
}
