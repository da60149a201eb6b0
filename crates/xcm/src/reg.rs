//! Readiness registry.
//!
//! Every socket owns one `mio::Poll`; its raw fd is the single readiness
//! descriptor handed to the application. The transport registers the OS
//! descriptors it is waiting on here, and the aggregate poll fd becomes
//! readable when any of them has a relevant event.
//!
//! mio registers edge-triggered. `ensure` therefore reregisters an entry
//! even when the wanted interest is unchanged: an `EPOLL_CTL_MOD` re-queues
//! a level-ready descriptor, and since the wait set is reconciled after
//! every socket operation, the aggregate fd behaves level-triggered.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use mio::{Interest, Registry, Token, unix::SourceFd};
use tracing::warn;

pub(crate) struct RegSet {
    registry: Registry,
    entries: Vec<(RawFd, Interest)>,
}

impl RegSet {
    pub(crate) fn new(registry: Registry) -> Self {
        Self { registry, entries: Vec::with_capacity(4) }
    }

    /// A second handle onto the same underlying poll instance, for inner
    /// sockets and the control channel.
    pub(crate) fn clone_registry(&self) -> io::Result<Registry> {
        self.registry.try_clone()
    }

    /// Make the registration for `fd` match `want`. `None` withdraws it.
    pub(crate) fn ensure(&mut self, fd: RawFd, want: Option<Interest>) {
        let token = Token(fd as usize);
        let pos = self.entries.iter().position(|(efd, _)| *efd == fd);

        let res = match (pos, want) {
            (None, None) => Ok(()),
            (None, Some(interest)) => {
                let res = self.registry.register(&mut SourceFd(&fd), token, interest);
                if res.is_ok() {
                    self.entries.push((fd, interest));
                }
                res
            }
            (Some(i), Some(interest)) => {
                // Unconditional reregister: re-arms the edge.
                let res = self.registry.reregister(&mut SourceFd(&fd), token, interest);
                if res.is_ok() {
                    self.entries[i].1 = interest;
                }
                res
            }
            (Some(i), None) => {
                let res = self.registry.deregister(&mut SourceFd(&fd));
                if res.is_ok() {
                    self.entries.swap_remove(i);
                }
                res
            }
        };

        if let Err(err) = res {
            warn!(fd, ?err, "readiness registration failed");
        }
    }

    /// Withdraw every registration. Must run before the fds are closed.
    pub(crate) fn clear(&mut self) {
        for (fd, _) in self.entries.drain(..) {
            if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                warn!(fd, ?err, "readiness deregistration failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|(efd, _)| *efd == fd)
    }
}

/// An eventfd that is permanently readable.
///
/// Registered whenever the socket can make progress without waiting for
/// I/O (a complete message is buffered, an error is latched, a background
/// step is pending), so a poll on the readiness descriptor returns
/// immediately.
pub(crate) struct Wakeup {
    fd: OwnedFd,
}

impl Wakeup {
    pub(crate) fn new() -> io::Result<Self> {
        // Counter starts at 1 and is never read, so the fd stays readable.
        let fd = unsafe { libc::eventfd(1, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_add_modify_delete() {
        let poll = mio::Poll::new().unwrap();
        let mut reg = RegSet::new(poll.registry().try_clone().unwrap());
        let wakeup = Wakeup::new().unwrap();
        let fd = wakeup.fd();

        reg.ensure(fd, Some(Interest::READABLE));
        assert!(reg.is_registered(fd));

        reg.ensure(fd, Some(Interest::READABLE | Interest::WRITABLE));
        assert!(reg.is_registered(fd));

        reg.ensure(fd, None);
        assert!(!reg.is_registered(fd));

        reg.ensure(fd, Some(Interest::READABLE));
        reg.clear();
        assert!(!reg.is_registered(fd));
    }

    #[test]
    fn wakeup_fd_is_permanently_readable() {
        let wakeup = Wakeup::new().unwrap();
        let mut pfd = libc::pollfd { fd: wakeup.fd(), events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(rc, 1);
        assert_ne!(pfd.revents & libc::POLLIN, 0);
    }
}
