use std::io;

use thiserror::Error;

/// Library-level error taxonomy.
///
/// OS error codes are normalized to these variants at the transport
/// boundary; no raw errno values leak through the public API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Message larger than the connection's `max_msg`, or a caller buffer
    /// too small to hold an attribute value.
    #[error("capacity exceeded")]
    CapacityExceeded,
    /// Non-blocking operation cannot make immediate progress.
    #[error("operation would block")]
    WouldBlock,
    #[error("no transport registered for protocol \"{0}\"")]
    NoTransport(String),
    #[error("no such attribute or entry")]
    NoEntry,
    #[error("address in use")]
    AddrInUse,
    #[error("access denied")]
    AccessDenied,
    #[error("name \"{0}\" did not resolve")]
    NoSuchName(String),
    #[error("out of file descriptors or memory")]
    ResourceExhausted,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("connection timed out")]
    TimedOut,
    /// Unrecoverable framing violation, TLS failure, or missing
    /// certificate material.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("interrupted by signal")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that terminate a connection. Once one of these is produced
    /// by a transport, it is latched on the socket and every subsequent
    /// operation repeats it.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused |
                Self::ConnectionReset |
                Self::ConnectionAborted |
                Self::HostUnreachable |
                Self::NetworkUnreachable |
                Self::TimedOut |
                Self::ProtocolError(_)
        )
    }

    /// Normalize an OS error to the taxonomy.
    pub(crate) fn from_io(err: &io::Error) -> Self {
        use io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock => Self::WouldBlock,
            ErrorKind::Interrupted => Self::Interrupted,
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => Self::ConnectionReset,
            ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            ErrorKind::AddrInUse => Self::AddrInUse,
            ErrorKind::PermissionDenied => Self::AccessDenied,
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::HostUnreachable => Self::HostUnreachable,
            ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            ErrorKind::NotFound => Self::ConnectionRefused,
            ErrorKind::OutOfMemory => Self::ResourceExhausted,
            _ => match err.raw_os_error() {
                Some(libc::EMSGSIZE) => Self::CapacityExceeded,
                Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                    Self::ResourceExhausted
                }
                Some(libc::ENOENT) => Self::ConnectionRefused,
                _ => Self::ProtocolError(err.to_string()),
            },
        }
    }

    /// Same normalization, starting from a raw errno value.
    pub(crate) fn from_errno(errno: i32) -> Self {
        Self::from_io(&io::Error::from_raw_os_error(errno))
    }
}
