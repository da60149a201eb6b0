//! Per-socket introspection channel.
//!
//! Each enabled socket binds a local seqpacket listener named
//! `xcm.<pid>.<sock-id>` under the control directory (`/run/xcm/ctl`,
//! overridable with `XCM_CTL`). Other processes connect and issue
//! fixed-size attribute queries; see [`CtlClient`].
//!
//! The channel is serviced opportunistically from the owning socket's
//! regular operations, with a call budget that keeps the per-operation
//! overhead bounded while clients are absent and the response latency
//! low while they are connected. Channel failures are logged and
//! contained; the application never sees them.

use std::{
    fs, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::PathBuf,
};

use mio::Interest;
use tracing::{debug, warn};

use crate::{
    attr::{self, AttrValue},
    error::{Error, Result},
    reg::RegSet,
    tp::{SocketCore, TpSocket, ux},
};

pub(crate) const CTL_DIR_ENV: &str = "XCM_CTL";
const DEFAULT_CTL_DIR: &str = "/run/xcm/ctl";

const MAX_CLIENTS: usize = 2;

const CALLS_PER_PROCESS_IDLE: u64 = 64;
const CALLS_PER_PROCESS_ACTIVE: u64 = 8;

// Wire format: fixed-size records over local datagrams.
const NAME_CAP: usize = 64;
const VALUE_CAP: usize = 256;
const MAX_ATTRS: usize = 32;

const ATTR_REC_SIZE: usize = NAME_CAP + 1 + 2 + VALUE_CAP;
const REQ_SIZE: usize = 4 + NAME_CAP;
const RESP_SIZE: usize = 4 + 4 + MAX_ATTRS * ATTR_REC_SIZE;

const REQ_GET_ATTR: u32 = 1;
const REQ_GET_ALL: u32 = 2;
const RESP_ATTR: u32 = 3;
const RESP_REJECT: u32 = 4;
const RESP_ALL: u32 = 5;

const REJ_NO_ENTRY: u32 = 1;
const REJ_ACCESS: u32 = 2;
const REJ_CAPACITY: u32 = 3;
const REJ_OTHER: u32 = 4;

const TY_BOOL: u8 = 1;
const TY_INT: u8 = 2;
const TY_STR: u8 = 3;
const TY_BIN: u8 = 4;

/// Resolved control-socket directory.
pub fn ctl_dir() -> PathBuf {
    std::env::var_os(CTL_DIR_ENV).map_or_else(|| PathBuf::from(DEFAULT_CTL_DIR), PathBuf::from)
}

fn ctl_path(pid: u32, sock_id: i64) -> PathBuf {
    ctl_dir().join(format!("xcm.{pid}.{sock_id}"))
}

/// Enumerate the `(pid, sock_id)` pairs with control sockets present in
/// the control directory. Entries may be stale if a process died between
/// bind and unlink.
pub fn list_ctl_sockets() -> io::Result<Vec<(u32, i64)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(ctl_dir())? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let mut parts = name.splitn(3, '.');
        if parts.next() != Some("xcm") {
            continue;
        }
        if let (Some(Ok(pid)), Some(Ok(id))) =
            (parts.next().map(str::parse), parts.next().map(str::parse))
        {
            out.push((pid, id));
        }
    }
    Ok(out)
}

fn encode_value(value: &AttrValue) -> Option<(u8, Vec<u8>)> {
    let (ty, bytes) = match value {
        AttrValue::Bool(v) => (TY_BOOL, vec![u8::from(*v)]),
        AttrValue::Int(v) => (TY_INT, v.to_le_bytes().to_vec()),
        AttrValue::Str(v) => (TY_STR, v.as_bytes().to_vec()),
        AttrValue::Bin(v) => (TY_BIN, v.clone()),
    };
    (bytes.len() <= VALUE_CAP).then_some((ty, bytes))
}

fn decode_value(ty: u8, bytes: &[u8]) -> Option<AttrValue> {
    Some(match ty {
        TY_BOOL => AttrValue::Bool(*bytes.first()? != 0),
        TY_INT => AttrValue::Int(i64::from_le_bytes(bytes.try_into().ok()?)),
        TY_STR => AttrValue::Str(String::from_utf8(bytes.to_vec()).ok()?),
        TY_BIN => AttrValue::Bin(bytes.to_vec()),
        _ => return None,
    })
}

fn put_name(rec: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    rec[..bytes.len()].copy_from_slice(bytes);
}

fn get_name(rec: &[u8]) -> String {
    let end = rec[..NAME_CAP].iter().position(|b| *b == 0).unwrap_or(NAME_CAP);
    String::from_utf8_lossy(&rec[..end]).into_owned()
}

/// Encode one (name, value) record; `None` when the name or value does
/// not fit the fixed record.
fn encode_attr_rec(name: &str, value: &AttrValue) -> Option<[u8; ATTR_REC_SIZE]> {
    if name.len() >= NAME_CAP {
        return None;
    }
    let (ty, bytes) = encode_value(value)?;

    let mut rec = [0u8; ATTR_REC_SIZE];
    put_name(&mut rec[..NAME_CAP], name);
    rec[NAME_CAP] = ty;
    rec[NAME_CAP + 1..NAME_CAP + 3].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    rec[NAME_CAP + 3..NAME_CAP + 3 + bytes.len()].copy_from_slice(&bytes);
    Some(rec)
}

fn decode_attr_rec(rec: &[u8]) -> Option<(String, AttrValue)> {
    let name = get_name(rec);
    let ty = rec[NAME_CAP];
    let len = u16::from_le_bytes([rec[NAME_CAP + 1], rec[NAME_CAP + 2]]) as usize;
    if len > VALUE_CAP {
        return None;
    }
    let value = decode_value(ty, &rec[NAME_CAP + 3..NAME_CAP + 3 + len])?;
    Some((name, value))
}

fn reject_code(err: &Error) -> u32 {
    match err {
        Error::NoEntry => REJ_NO_ENTRY,
        Error::AccessDenied => REJ_ACCESS,
        Error::CapacityExceeded => REJ_CAPACITY,
        _ => REJ_OTHER,
    }
}

fn reject_error(code: u32) -> Error {
    match code {
        REJ_NO_ENTRY => Error::NoEntry,
        REJ_ACCESS => Error::AccessDenied,
        REJ_CAPACITY => Error::CapacityExceeded,
        _ => Error::InvalidInput("control channel rejected the request".into()),
    }
}

struct Client {
    fd: OwnedFd,
    pending: Option<Vec<u8>>,
}

pub(crate) struct Ctl {
    server: OwnedFd,
    path: PathBuf,
    clients: Vec<Client>,
    reg: RegSet,
    calls_since_process: u64,
}

impl Ctl {
    /// Bind the control listener for a socket. Failures (typically a
    /// missing control directory) disable the channel, nothing more.
    pub(crate) fn create(core: &SocketCore) -> Option<Self> {
        let dir = ctl_dir();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                debug!(dir = %dir.display(), "control directory unavailable");
                return None;
            }
        }

        let path = ctl_path(std::process::id(), core.sock_id);
        let _ = fs::remove_file(&path);

        let res = (|| -> io::Result<OwnedFd> {
            let fd = ux::seqpacket_socket()?;
            let (sa, sa_len) = ux::sockaddr_un(ux::UxNamespace::Path, &path.to_string_lossy())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            if unsafe {
                libc::bind(fd.as_raw_fd(), (&sa as *const libc::sockaddr_un).cast(), sa_len)
            } < 0
            {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::listen(fd.as_raw_fd(), MAX_CLIENTS as libc::c_int) } < 0 {
                let _ = fs::remove_file(&path);
                return Err(io::Error::last_os_error());
            }
            Ok(fd)
        })();

        let server = match res {
            Ok(fd) => fd,
            Err(err) => {
                warn!(path = %path.display(), %err, "control listener setup failed");
                return None;
            }
        };

        let registry = match core.reg.clone_registry() {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "control listener registry clone failed");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        let mut reg = RegSet::new(registry);
        reg.ensure(server.as_raw_fd(), Some(Interest::READABLE));

        debug!(path = %path.display(), "control listener created");
        Some(Self { server, path, clients: Vec::new(), reg, calls_since_process: 0 })
    }

    fn min_calls(&self) -> u64 {
        if self.clients.is_empty() { CALLS_PER_PROCESS_IDLE } else { CALLS_PER_PROCESS_ACTIVE }
    }

    /// One opportunistic servicing step; cheap until the call budget is
    /// reached.
    pub(crate) fn process(&mut self, sock: &TpSocket) {
        self.calls_since_process += 1;
        if self.calls_since_process < self.min_calls() {
            return;
        }
        self.calls_since_process = 0;

        let mut i = 0;
        while i < self.clients.len() {
            if self.step_client(i, sock) {
                i += 1;
            } else {
                self.remove_client(i);
            }
        }

        if self.clients.len() < MAX_CLIENTS {
            self.accept_client();
        }
    }

    fn remove_client(&mut self, idx: usize) {
        let client = self.clients.swap_remove(idx);
        self.reg.ensure(client.fd.as_raw_fd(), None);
        // Dropping below the cap makes the listener acceptable again.
        if self.clients.len() == MAX_CLIENTS - 1 {
            self.reg.ensure(self.server.as_raw_fd(), Some(Interest::READABLE));
        }
        debug!("control client removed");
    }

    fn accept_client(&mut self) {
        let fd = unsafe {
            libc::accept4(
                self.server.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(%err, "control accept failed");
            }
            return;
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        self.reg.ensure(fd.as_raw_fd(), Some(Interest::READABLE));
        self.clients.push(Client { fd, pending: None });

        if self.clients.len() == MAX_CLIENTS {
            self.reg.ensure(self.server.as_raw_fd(), None);
        }
        debug!(clients = self.clients.len(), "control client accepted");
    }

    /// Returns false when the client should be dropped.
    fn step_client(&mut self, idx: usize, sock: &TpSocket) -> bool {
        let client = &mut self.clients[idx];

        if let Some(response) = &client.pending {
            let rc = unsafe {
                libc::send(
                    client.fd.as_raw_fd(),
                    response.as_ptr().cast(),
                    response.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return true;
                }
                debug!(%err, "control client send failed");
                return false;
            }
            client.pending = None;
            let fd = client.fd.as_raw_fd();
            self.reg.ensure(fd, Some(Interest::READABLE));
            return true;
        }

        let mut req = [0u8; REQ_SIZE];
        let rc = unsafe {
            libc::recv(client.fd.as_raw_fd(), req.as_mut_ptr().cast(), req.len(), 0)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return true;
            }
            debug!(%err, "control client recv failed");
            return false;
        }
        if rc as usize != REQ_SIZE {
            debug!(len = rc, "malformed control request");
            return false;
        }

        let req_type = u32::from_le_bytes(req[..4].try_into().unwrap());
        let response = match req_type {
            REQ_GET_ATTR => {
                let name = get_name(&req[4..]);
                Self::respond_get_attr(sock, &name)
            }
            REQ_GET_ALL => Self::respond_get_all(sock),
            _ => {
                debug!(req_type, "unknown control request");
                return false;
            }
        };

        client.pending = Some(response);
        let fd = client.fd.as_raw_fd();
        self.reg.ensure(fd, Some(Interest::WRITABLE));
        true
    }

    fn respond_get_attr(sock: &TpSocket, name: &str) -> Vec<u8> {
        let mut resp = vec![0u8; 4 + 4 + ATTR_REC_SIZE];
        match attr::get(sock, name) {
            // A value too large for the fixed record is reported as a
            // capacity problem, not truncated.
            Ok(value) => match encode_attr_rec(name, &value) {
                Some(rec) => {
                    resp[..4].copy_from_slice(&RESP_ATTR.to_le_bytes());
                    resp[8..8 + ATTR_REC_SIZE].copy_from_slice(&rec);
                }
                None => {
                    resp[..4].copy_from_slice(&RESP_REJECT.to_le_bytes());
                    resp[4..8].copy_from_slice(&REJ_CAPACITY.to_le_bytes());
                }
            },
            Err(err) => {
                resp[..4].copy_from_slice(&RESP_REJECT.to_le_bytes());
                resp[4..8].copy_from_slice(&reject_code(&err).to_le_bytes());
            }
        }
        resp
    }

    fn respond_get_all(sock: &TpSocket) -> Vec<u8> {
        let mut resp = vec![0u8; RESP_SIZE];
        resp[..4].copy_from_slice(&RESP_ALL.to_le_bytes());

        let mut count: u32 = 0;
        attr::visit_all(sock, &mut |name, value| {
            if count as usize >= MAX_ATTRS {
                return;
            }
            // Oversized values are left out of the vector.
            if let Some(rec) = encode_attr_rec(name, value) {
                let off = 8 + count as usize * ATTR_REC_SIZE;
                resp[off..off + ATTR_REC_SIZE].copy_from_slice(&rec);
                count += 1;
            }
        });
        resp[4..8].copy_from_slice(&count.to_le_bytes());
        resp
    }

    /// Tear the channel down. The filesystem entry is only unlinked by
    /// the owning side; the fork loser leaves it alone.
    pub(crate) fn destroy(mut self, owner: bool) {
        for client in &self.clients {
            self.reg.ensure(client.fd.as_raw_fd(), None);
        }
        self.reg.ensure(self.server.as_raw_fd(), None);
        if owner {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Out-of-process reader for a socket's control channel.
///
/// Used by external inspection tooling and the integration tests; the
/// observed socket's owner stays completely unaware of it.
pub struct CtlClient {
    fd: OwnedFd,
}

impl CtlClient {
    /// Connect to the control socket of `(pid, sock_id)`.
    pub fn connect(pid: u32, sock_id: i64) -> io::Result<Self> {
        let path = ctl_path(pid, sock_id);

        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (sa, sa_len) = ux::sockaddr_un(ux::UxNamespace::Path, &path.to_string_lossy())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        if unsafe { libc::connect(fd.as_raw_fd(), (&sa as *const libc::sockaddr_un).cast(), sa_len) } <
            0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn roundtrip(&self, req: &[u8; REQ_SIZE]) -> Result<Vec<u8>> {
        let rc = unsafe {
            libc::send(self.fd.as_raw_fd(), req.as_ptr().cast(), req.len(), libc::MSG_NOSIGNAL)
        };
        if rc < 0 {
            return Err(Error::from_io(&io::Error::last_os_error()));
        }

        let mut resp = vec![0u8; RESP_SIZE];
        let rc = unsafe { libc::recv(self.fd.as_raw_fd(), resp.as_mut_ptr().cast(), resp.len(), 0) };
        if rc < 0 {
            return Err(Error::from_io(&io::Error::last_os_error()));
        }
        if (rc as usize) < 8 {
            return Err(Error::ProtocolError("short control response".into()));
        }
        resp.truncate(rc as usize);
        Ok(resp)
    }

    /// Read a single attribute by name.
    pub fn get_attr(&self, name: &str) -> Result<AttrValue> {
        if name.len() >= NAME_CAP {
            return Err(Error::InvalidInput(format!("attribute name \"{name}\" too long")));
        }
        let mut req = [0u8; REQ_SIZE];
        req[..4].copy_from_slice(&REQ_GET_ATTR.to_le_bytes());
        put_name(&mut req[4..], name);

        let resp = self.roundtrip(&req)?;
        match u32::from_le_bytes(resp[..4].try_into().unwrap()) {
            RESP_ATTR => resp
                .get(8..8 + ATTR_REC_SIZE)
                .and_then(decode_attr_rec)
                .map(|(_, value)| value)
                .ok_or_else(|| Error::ProtocolError("malformed control response".into())),
            RESP_REJECT => {
                Err(reject_error(u32::from_le_bytes(resp[4..8].try_into().unwrap())))
            }
            _ => Err(Error::ProtocolError("unexpected control response".into())),
        }
    }

    /// Read the socket's complete attribute vector.
    pub fn get_all(&self) -> Result<Vec<(String, AttrValue)>> {
        let mut req = [0u8; REQ_SIZE];
        req[..4].copy_from_slice(&REQ_GET_ALL.to_le_bytes());

        let resp = self.roundtrip(&req)?;
        if u32::from_le_bytes(resp[..4].try_into().unwrap()) != RESP_ALL {
            return Err(Error::ProtocolError("unexpected control response".into()));
        }

        let count = u32::from_le_bytes(resp[4..8].try_into().unwrap()) as usize;
        let mut attrs = Vec::with_capacity(count.min(MAX_ATTRS));
        for i in 0..count.min(MAX_ATTRS) {
            let off = 8 + i * ATTR_REC_SIZE;
            let rec = resp
                .get(off..off + ATTR_REC_SIZE)
                .ok_or_else(|| Error::ProtocolError("short control response".into()))?;
            attrs.push(
                decode_attr_rec(rec)
                    .ok_or_else(|| Error::ProtocolError("malformed control response".into()))?,
            );
        }
        Ok(attrs)
    }
}
