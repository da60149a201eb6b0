//! TLS transport: the framed-stream engine on top of a rustls session,
//! itself driven sans-io over a non-blocking TCP socket.
//!
//! Certificate, trust-chain and private-key material comes from the
//! certificate directory collaborator at socket creation; a missing file
//! is a protocol error. The TCP liveness options and their attributes are
//! shared with the plain TCP transport.

use std::{
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use mio::{
    Interest,
    net::{TcpListener, TcpStream},
};
use rustls::{ClientConnection, Connection, ServerConnection};
use rustls_pki_types::ServerName;
use tracing::debug;

use crate::{
    addr::{self, Host},
    attr::{AttrSpec, AttrType, AttrValue},
    cert::{self, TlsConfigs},
    error::{Error, Result},
    tp::{
        Condition, SocketCore, SocketKind, Transport,
        stream::{FramedSession, RecvStatus},
        tcp::{TCP_MAX_MSG, TcpOpts, apply_opts, connect_progress, opt_attr_specs, opt_get_attr,
              opt_set_attr, resolve_tail},
    },
};

pub(crate) fn create(_kind: SocketKind) -> Box<dyn Transport> {
    Box::new(TlsTransport::new())
}

/// A TLS session bound to its TCP socket. `Read`/`Write` are the
/// *plaintext* side, so the framed engine layers directly on top.
struct TlsIo {
    stream: TcpStream,
    tls: Connection,
}

impl TlsIo {
    /// Move ciphertext in both directions without blocking: flush what
    /// the session wants written, then ingest whatever the socket has.
    fn pump(&mut self) -> Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from_io(&e)),
            }
        }

        while self.tls.wants_read() {
            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    // Wire EOF. Let the session digest it; the plaintext
                    // reader then reports clean close or truncation.
                    self.tls
                        .process_new_packets()
                        .map_err(|e| Error::ProtocolError(format!("TLS failure: {e}")))?;
                    break;
                }
                Ok(_) => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| Error::ProtocolError(format!("TLS failure: {e}")))?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from_io(&e)),
            }
        }
        Ok(())
    }
}

impl Read for TlsIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.tls.reader().read(buf) {
            // TCP EOF without close_notify: the peer (or its host) went
            // away mid-stream.
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(io::Error::from_raw_os_error(libc::ECONNRESET))
            }
            other => other,
        }
    }
}

impl Write for TlsIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Plaintext hand-off to the TLS layer; always accepted. The
        // transport gates sends on pending ciphertext, which bounds the
        // session's buffering to one frame.
        self.tls.writer().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum TlsState {
    Init,
    /// TCP three-way handshake still in flight.
    TcpConnecting { stream: TcpStream, tls: Box<ClientConnection> },
    /// TLS handshake in progress.
    Handshake { io: TlsIo, session: FramedSession },
    Conn { io: TlsIo, session: FramedSession },
    Server { listener: TcpListener, local: SocketAddr, configs: TlsConfigs },
    Closed,
}

pub(crate) struct TlsTransport {
    state: TlsState,
    opts: TcpOpts,
}

impl TlsTransport {
    pub(crate) fn new() -> Self {
        Self { state: TlsState::Init, opts: TcpOpts::default() }
    }

    fn fd(&self) -> Option<RawFd> {
        match &self.state {
            TlsState::TcpConnecting { stream, .. } => Some(stream.as_raw_fd()),
            TlsState::Handshake { io, .. } | TlsState::Conn { io, .. } => {
                Some(io.stream.as_raw_fd())
            }
            TlsState::Server { listener, .. } => Some(listener.as_raw_fd()),
            TlsState::Init | TlsState::Closed => None,
        }
    }

    /// Advance TCP connect and TLS handshake as far as the socket
    /// allows. Returns whether application data can flow.
    fn drive_handshake(&mut self) -> Result<bool> {
        if let TlsState::TcpConnecting { stream, .. } = &self.state {
            if !connect_progress(stream)? {
                return Ok(false);
            }
            debug!("tcp connect completed, starting TLS handshake");
            let TlsState::TcpConnecting { stream, tls } =
                mem::replace(&mut self.state, TlsState::Init)
            else {
                unreachable!();
            };
            self.state = TlsState::Handshake {
                io: TlsIo { stream, tls: Connection::Client(*tls) },
                session: FramedSession::new(TCP_MAX_MSG),
            };
        }

        if let TlsState::Handshake { io, .. } = &mut self.state {
            io.pump()?;
            if io.tls.is_handshaking() {
                return Ok(false);
            }
            debug!("TLS handshake completed");
            let TlsState::Handshake { io, session } = mem::replace(&mut self.state, TlsState::Init)
            else {
                unreachable!();
            };
            self.state = TlsState::Conn { io, session };
        }

        match &self.state {
            TlsState::Conn { .. } => Ok(true),
            TlsState::Init | TlsState::Closed => {
                Err(Error::InvalidInput("not a connection socket".into()))
            }
            _ => Ok(false),
        }
    }

    fn conn_mut(&mut self) -> Result<(&mut TlsIo, &mut FramedSession)> {
        match &mut self.state {
            TlsState::Conn { io, session } => Ok((io, session)),
            _ => Err(Error::WouldBlock),
        }
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self, _core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let (hp, sa) = resolve_tail(addr::TLS_PROTO, remote_addr)?;
        debug!(addr = remote_addr, "tls connect");

        let configs = cert::load()?;

        let server_name: ServerName<'static> = match &hp.host {
            Host::Name(name) => ServerName::try_from(name.clone())
                .map_err(|_| Error::InvalidInput(format!("bad server name \"{name}\"")))?,
            Host::Ip(ip) => ServerName::IpAddress((*ip).into()),
            Host::Any => {
                return Err(Error::InvalidInput("cannot connect to a wildcard address".into()));
            }
        };

        let tls = ClientConnection::new(configs.client, server_name)
            .map_err(|e| Error::ProtocolError(format!("TLS client setup: {e}")))?;

        let stream = TcpStream::connect(sa).map_err(|e| Error::from_io(&e))?;
        apply_opts(stream.as_raw_fd(), &self.opts).map_err(|e| Error::from_io(&e))?;

        self.state = TlsState::TcpConnecting { stream, tls: Box::new(tls) };
        Ok(())
    }

    fn server(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        let (_, sa) = resolve_tail(addr::TLS_PROTO, local_addr)?;
        debug!(addr = local_addr, "tls server");

        let configs = cert::load()?;
        let listener = TcpListener::bind(sa).map_err(|e| Error::from_io(&e))?;
        let local = listener.local_addr().map_err(|e| Error::from_io(&e))?;

        self.state = TlsState::Server { listener, local, configs };
        Ok(())
    }

    fn accept(
        &mut self,
        _core: &mut SocketCore,
        _conn_core: &mut SocketCore,
    ) -> Result<Box<dyn Transport>> {
        let TlsState::Server { listener, configs, .. } = &self.state else {
            return Err(Error::InvalidInput("not a server socket".into()));
        };

        let (stream, peer) = listener.accept().map_err(|e| Error::from_io(&e))?;
        debug!(?peer, "tls accepted, handshake pending");
        apply_opts(stream.as_raw_fd(), &self.opts).map_err(|e| Error::from_io(&e))?;

        let tls = ServerConnection::new(configs.server.clone())
            .map_err(|e| Error::ProtocolError(format!("TLS server setup: {e}")))?;

        Ok(Box::new(Self {
            state: TlsState::Handshake {
                io: TlsIo { stream, tls: Connection::Server(tls) },
                session: FramedSession::new(TCP_MAX_MSG),
            },
            opts: self.opts,
        }))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        if !self.drive_handshake()? {
            return Err(Error::WouldBlock);
        }
        let (io, session) = self.conn_mut()?;

        io.pump()?;
        if io.tls.wants_write() {
            // Previous frame's ciphertext has not drained; hold the
            // caller back rather than buffering without bound.
            return Err(Error::WouldBlock);
        }

        session.enqueue(buf)?;
        core.cnt.msg_from_app(buf.len());

        // The plaintext hand-off always completes; that is the moment
        // the frame reaches the lower (TLS) layer.
        if let Some(payload) = session.drive_send(io)? {
            core.cnt.msg_to_lower(payload);
        }
        io.pump()?;
        Ok(())
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        if !self.drive_handshake()? {
            return Err(Error::WouldBlock);
        }
        let (io, session) = self.conn_mut()?;

        io.pump()?;
        match session.drive_recv(io)? {
            RecvStatus::MsgReady => {
                let n = session.take_msg(buf);
                core.cnt.msg_to_app(n);
                // Reassemble any plaintext already decrypted so the
                // readiness state reflects it.
                let _ = session.drive_recv(io);
                Ok(n)
            }
            RecvStatus::Pending => Err(Error::WouldBlock),
            RecvStatus::Eof => Ok(0),
        }
    }

    fn finish(&mut self, core: &mut SocketCore) -> Result<()> {
        match &self.state {
            TlsState::Server { .. } | TlsState::Init | TlsState::Closed => return Ok(()),
            _ => {}
        }

        if !self.drive_handshake()? {
            return Err(Error::WouldBlock);
        }
        let (io, session) = self.conn_mut()?;

        if session.sending() {
            if let Some(payload) = session.drive_send(io)? {
                core.cnt.msg_to_lower(payload);
            }
        }
        io.pump()?;
        if io.tls.wants_write() {
            return Err(Error::WouldBlock);
        }

        if !session.msg_ready() {
            let _ = session.drive_recv(io)?;
        }
        Ok(())
    }

    fn update(&mut self, core: &mut SocketCore) {
        match &self.state {
            TlsState::TcpConnecting { stream, .. } => {
                core.reg.ensure(stream.as_raw_fd(), Some(Interest::WRITABLE));
                core.set_active(false);
            }
            TlsState::Handshake { io, .. } => {
                let mut interest = None;
                if io.tls.wants_read() {
                    interest = Some(Interest::READABLE);
                }
                if io.tls.wants_write() {
                    interest =
                        Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                core.reg.ensure(io.stream.as_raw_fd(), interest);
                core.set_active(false);
            }
            TlsState::Conn { io, session } => {
                let mut interest = None;
                let want_read = (core.condition.contains(Condition::RECEIVABLE) &&
                    !session.msg_ready()) ||
                    session.recv_in_progress();
                if want_read {
                    interest = Some(Interest::READABLE);
                }
                if io.tls.wants_write() || core.condition.contains(Condition::SENDABLE) {
                    interest =
                        Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                core.reg.ensure(io.stream.as_raw_fd(), interest);

                let immediate = (core.condition.contains(Condition::RECEIVABLE) &&
                    session.msg_ready()) ||
                    session.check().is_err();
                core.set_active(immediate);
            }
            TlsState::Server { listener, .. } => {
                let interest =
                    core.condition.contains(Condition::ACCEPTABLE).then_some(Interest::READABLE);
                core.reg.ensure(listener.as_raw_fd(), interest);
            }
            TlsState::Init | TlsState::Closed => {}
        }
    }

    fn close(&mut self, core: &mut SocketCore) {
        core.reg.clear();
        if let TlsState::Conn { io, .. } = &mut self.state {
            io.tls.send_close_notify();
            let _ = io.pump();
        }
        self.state = TlsState::Closed;
    }

    fn cleanup(&mut self, core: &mut SocketCore) {
        // No close_notify: the owner side keeps the session.
        core.reg.clear();
        self.state = TlsState::Closed;
    }

    fn local_addr(&self) -> Option<String> {
        match &self.state {
            TlsState::Server { local, .. } => {
                Some(addr::format_socket_addr(addr::TLS_PROTO, local))
            }
            TlsState::Conn { io, .. } | TlsState::Handshake { io, .. } => io
                .stream
                .local_addr()
                .ok()
                .map(|sa| addr::format_socket_addr(addr::TLS_PROTO, &sa)),
            _ => None,
        }
    }

    fn remote_addr(&self) -> Option<String> {
        match &self.state {
            TlsState::Conn { io, .. } | TlsState::Handshake { io, .. } => io
                .stream
                .peer_addr()
                .ok()
                .map(|sa| addr::format_socket_addr(addr::TLS_PROTO, &sa)),
            _ => None,
        }
    }

    fn max_msg(&self) -> usize {
        TCP_MAX_MSG
    }

    fn attr_specs(&self, kind: SocketKind) -> Vec<AttrSpec> {
        match kind {
            SocketKind::Connection => {
                let mut specs = opt_attr_specs();
                specs.push(AttrSpec::ro("tls.peer_subject_key_id", AttrType::Str));
                specs
            }
            SocketKind::Server => Vec::new(),
        }
    }

    fn get_attr(&self, _core: &SocketCore, name: &str) -> Result<AttrValue> {
        if name == "tls.peer_subject_key_id" {
            let TlsState::Conn { io, .. } = &self.state else {
                return Err(Error::NoEntry);
            };
            let certs = io.tls.peer_certificates().ok_or(Error::NoEntry)?;
            let der = certs.first().ok_or(Error::NoEntry)?;
            let ski = subject_key_id(der.as_ref()).ok_or(Error::NoEntry)?;
            return Ok(AttrValue::Str(hex_colon(&ski)));
        }
        opt_get_attr(&self.opts, self.fd(), name)
    }

    fn set_attr(&mut self, _core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        if name == "tls.peer_subject_key_id" {
            return Err(Error::AccessDenied);
        }
        let fd = self.fd();
        opt_set_attr(&mut self.opts, fd, name, value)
    }
}

/// Extract the SubjectKeyIdentifier extension value from a DER-encoded
/// certificate: OID 2.5.29.14 followed by an OCTET STRING wrapping the
/// OCTET STRING key identifier (short-form lengths; identifiers are
/// 20 bytes in practice).
fn subject_key_id(der: &[u8]) -> Option<Vec<u8>> {
    const OID_SKI: [u8; 5] = [0x06, 0x03, 0x55, 0x1d, 0x0e];

    let pos = der.windows(OID_SKI.len()).position(|w| w == OID_SKI)?;
    let mut rest = &der[pos + OID_SKI.len()..];

    // Optional BOOLEAN "critical".
    if rest.first() == Some(&0x01) {
        rest = rest.get(3..)?;
    }

    if *rest.first()? != 0x04 {
        return None;
    }
    let outer_len = *rest.get(1)? as usize;
    let inner = rest.get(2..2 + outer_len)?;

    if *inner.first()? != 0x04 {
        return None;
    }
    let ski_len = *inner.get(1)? as usize;
    inner.get(2..2 + ski_len).map(<[u8]>::to_vec)
}

fn hex_colon(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_subject_key_id() {
        let mut der = vec![0x30, 0x82, 0x01, 0x00, 0xaa, 0xbb];
        der.extend_from_slice(&[0x06, 0x03, 0x55, 0x1d, 0x0e]); // OID 2.5.29.14
        der.extend_from_slice(&[0x04, 0x06, 0x04, 0x04]); // nested octet strings
        der.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        der.extend_from_slice(&[0x99, 0x99]);

        assert_eq!(subject_key_id(&der), Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn skips_critical_flag() {
        let mut der = vec![0x06, 0x03, 0x55, 0x1d, 0x0e];
        der.extend_from_slice(&[0x01, 0x01, 0xff]); // BOOLEAN true
        der.extend_from_slice(&[0x04, 0x04, 0x04, 0x02, 0x01, 0x02]);

        assert_eq!(subject_key_id(&der), Some(vec![0x01, 0x02]));
    }

    #[test]
    fn missing_extension_yields_none() {
        assert_eq!(subject_key_id(&[0x30, 0x03, 0x01, 0x01, 0x00]), None);
    }

    #[test]
    fn formats_hex_with_colons() {
        assert_eq!(hex_colon(&[0x0a, 0xff, 0x00]), "0a:ff:00");
    }
}
