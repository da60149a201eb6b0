//! UTLS hybrid transport.
//!
//! Uses a UX (abstract-namespace) socket when client and server share a
//! network namespace, TLS otherwise. A UTLS socket wraps two full inner
//! sockets registered against the outer socket's readiness descriptor;
//! connect and accept resolve which one survives, and the outer socket
//! then masquerades as the active one: `xcm.transport` on a UTLS
//! connection reads `ux` or `tls`, never `utls`.
//!
//! Wildcard server addresses and client/server naming mismatches defeat
//! the local-path probe; the client then quietly stays on TLS. That is
//! documented behavior, not an error.

use tracing::debug;

use crate::{
    addr::{self, HostPort},
    attr::{AttrSpec, AttrValue},
    cnt::ConnCnt,
    error::{Error, Result},
    tp::{SocketCore, SocketKind, TpSocket, Transport, proto_by_name},
};

pub(crate) fn create(kind: SocketKind) -> Box<dyn Transport> {
    Box::new(UtlsTransport { kind, ux: None, tls: None })
}

pub(crate) struct UtlsTransport {
    kind: SocketKind,
    ux: Option<Box<TpSocket>>,
    tls: Option<Box<TpSocket>>,
}

impl UtlsTransport {
    fn parse(full_addr: &str) -> Result<HostPort> {
        let (proto, tail) = addr::split_proto(full_addr)?;
        if proto != addr::UTLS_PROTO {
            return Err(Error::InvalidInput(format!("bad utls address \"{full_addr}\"")));
        }
        HostPort::parse(tail)
    }

    /// The surviving inner socket of a connection.
    fn active(&self) -> Result<&TpSocket> {
        self.ux
            .as_deref()
            .or(self.tls.as_deref())
            .ok_or_else(|| Error::InvalidInput("no active sub-socket".into()))
    }

    fn active_mut(&mut self) -> Result<&mut TpSocket> {
        self.ux
            .as_deref_mut()
            .or(self.tls.as_deref_mut())
            .ok_or_else(|| Error::InvalidInput("no active sub-socket".into()))
    }

    fn sub_for_conn(sub: TpSocket) -> Box<dyn Transport> {
        Box::new(Self { kind: SocketKind::Connection, ux: Some(Box::new(sub)), tls: None })
    }
}

fn create_sub(core: &SocketCore, proto: &'static str, kind: SocketKind) -> Result<Box<TpSocket>> {
    let registry = core.reg.clone_registry().map_err(|e| Error::from_io(&e))?;
    Ok(Box::new(TpSocket::create(proto_by_name(proto)?, kind, registry, false)?))
}

impl Transport for UtlsTransport {
    fn init(&mut self, core: &mut SocketCore) -> Result<()> {
        self.ux = Some(create_sub(core, addr::UX_PROTO, core.kind)?);
        self.tls = Some(create_sub(core, addr::TLS_PROTO, core.kind)?);
        Ok(())
    }

    fn connect(&mut self, _core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let hp = Self::parse(remote_addr)?;
        let tail = hp.to_string();
        let ux_addr = addr::ux_name_for_tail(&tail);
        let tls_addr = addr::format_ip_addr(addr::TLS_PROTO, &hp);

        // Unlike TCP, a local connect to a missing endpoint reports
        // connection-refused immediately, even non-blocking; that is the
        // probe for a same-namespace server.
        let ux = self.ux.as_mut().expect("init ran");
        match ux.connect(&ux_addr) {
            Ok(()) => {
                debug!(addr = remote_addr, "utls took the local path");
                if let Some(mut tls) = self.tls.take() {
                    tls.close();
                }
                Ok(())
            }
            Err(Error::ConnectionRefused) => {
                debug!(addr = remote_addr, "no local peer, falling back to tls");
                self.ux = None;
                self.tls.as_mut().expect("init ran").connect(&tls_addr)
            }
            Err(err) => Err(err),
        }
    }

    fn server(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        let hp = Self::parse(local_addr)?;
        let tls_addr = addr::format_ip_addr(addr::TLS_PROTO, &hp);

        // TLS first, so a kernel-assigned port can be mirrored into the
        // local listener's name.
        let tls = self.tls.as_mut().expect("init ran");
        tls.server(&tls_addr)?;

        let actual_tail = if hp.port == 0 {
            let bound = tls
                .tp
                .local_addr()
                .ok_or_else(|| Error::InvalidInput("tls listener has no address".into()))?;
            let (_, tail) = addr::split_proto(&bound)?;
            debug!(tail, "kernel-assigned port mirrored into local listener");
            tail.to_string()
        } else {
            hp.to_string()
        };

        let ux_addr = addr::ux_name_for_tail(&actual_tail);
        self.ux.as_mut().expect("init ran").server(&ux_addr)
    }

    fn accept(
        &mut self,
        _core: &mut SocketCore,
        conn_core: &mut SocketCore,
    ) -> Result<Box<dyn Transport>> {
        if self.kind != SocketKind::Server {
            return Err(Error::InvalidInput("not a server socket".into()));
        }

        // Local connections take preference.
        let ux = self.ux.as_mut().expect("init ran");
        match ux.accept(conn_core.reg.clone_registry().map_err(|e| Error::from_io(&e))?, false) {
            Ok(sub) => return Ok(Self::sub_for_conn(sub)),
            Err(err) => debug!(%err, "no local connection pending"),
        }

        let tls = self.tls.as_mut().expect("init ran");
        let sub =
            tls.accept(conn_core.reg.clone_registry().map_err(|e| Error::from_io(&e))?, false)?;
        Ok(Box::new(Self {
            kind: SocketKind::Connection,
            ux: None,
            tls: Some(Box::new(sub)),
        }))
    }

    fn send(&mut self, _core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        self.active_mut()?.send(buf)
    }

    fn receive(&mut self, _core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        self.active_mut()?.receive(buf)
    }

    fn finish(&mut self, _core: &mut SocketCore) -> Result<()> {
        match self.kind {
            SocketKind::Connection => self.active_mut()?.finish(),
            SocketKind::Server => {
                if let Some(ux) = self.ux.as_deref_mut() {
                    ux.finish()?;
                }
                if let Some(tls) = self.tls.as_deref_mut() {
                    tls.finish()?;
                }
                Ok(())
            }
        }
    }

    fn update(&mut self, core: &mut SocketCore) {
        // Inner sockets inherit the outer condition mask; for servers,
        // both listeners watch for it.
        for sub in [self.ux.as_deref_mut(), self.tls.as_deref_mut()].into_iter().flatten() {
            sub.core.condition = core.condition;
            sub.update();
        }
    }

    fn close(&mut self, core: &mut SocketCore) {
        core.reg.clear();
        if let Some(mut ux) = self.ux.take() {
            ux.close();
        }
        if let Some(mut tls) = self.tls.take() {
            tls.close();
        }
    }

    fn cleanup(&mut self, core: &mut SocketCore) {
        core.reg.clear();
        if let Some(mut ux) = self.ux.take() {
            ux.cleanup();
        }
        if let Some(mut tls) = self.tls.take() {
            tls.cleanup();
        }
    }

    fn local_addr(&self) -> Option<String> {
        match self.kind {
            SocketKind::Connection => self.active().ok()?.tp.local_addr(),
            SocketKind::Server => {
                // Reported as utls:<ip>:<port>, rebuilt from the TLS
                // listener so a kernel-assigned port shows through.
                let bound = self.tls.as_deref()?.tp.local_addr()?;
                let (_, tail) = addr::split_proto(&bound).ok()?;
                Some(format!("{}:{tail}", addr::UTLS_PROTO))
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.active().ok()?.tp.remote_addr()
    }

    fn max_msg(&self) -> usize {
        self.active().map_or(0, |sub| sub.tp.max_msg())
    }

    fn transport_tag(&self) -> Option<&'static str> {
        match self.kind {
            // Masquerade as the transport actually carrying the data.
            SocketKind::Connection => self.active().ok().map(TpSocket::transport_tag),
            SocketKind::Server => None,
        }
    }

    fn counters<'a>(&'a self, core: &'a SocketCore) -> &'a ConnCnt {
        self.active().map_or(&core.cnt, |sub| sub.counters())
    }

    fn attr_specs(&self, _kind: SocketKind) -> Vec<AttrSpec> {
        let mut specs = Vec::new();
        for sub in [self.ux.as_deref(), self.tls.as_deref()].into_iter().flatten() {
            specs.extend(sub.tp.attr_specs(sub.core.kind));
        }
        specs
    }

    fn get_attr(&self, _core: &SocketCore, name: &str) -> Result<AttrValue> {
        for sub in [self.ux.as_deref(), self.tls.as_deref()].into_iter().flatten() {
            match sub.tp.get_attr(&sub.core, name) {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }
        Err(Error::NoEntry)
    }

    fn set_attr(&mut self, _core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        for sub in [self.ux.as_deref_mut(), self.tls.as_deref_mut()].into_iter().flatten() {
            match sub.tp.set_attr(&mut sub.core, name, value) {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }
        Err(Error::NoEntry)
    }

    fn enable_sub_ctl(&mut self) -> bool {
        match self.kind {
            SocketKind::Connection => {
                if let Ok(sub) = self.active_mut() {
                    sub.enable_ctl();
                }
                true
            }
            SocketKind::Server => {
                // All three server-side sockets show up on the control
                // directory: outer utls, inner ux, inner tls.
                for sub in [self.ux.as_deref_mut(), self.tls.as_deref_mut()].into_iter().flatten()
                {
                    sub.enable_ctl();
                }
                false
            }
        }
    }
}
