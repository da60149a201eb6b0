//! Address-string parsing and formatting.
//!
//! Addresses have the form `<proto>:<proto-specific>`. For the IP-based
//! transports the tail is `(<dns-name>|<ipv4>|[<ipv6>]|[*]|*):<port>`;
//! for UX it is an opaque name in the abstract socket namespace and for
//! UXF a filesystem path.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

use crate::error::{Error, Result};

pub(crate) const UX_PROTO: &str = "ux";
pub(crate) const UXF_PROTO: &str = "uxf";
pub(crate) const TCP_PROTO: &str = "tcp";
pub(crate) const TLS_PROTO: &str = "tls";
pub(crate) const UTLS_PROTO: &str = "utls";

/// Split `<proto>:<tail>`.
pub(crate) fn split_proto(addr: &str) -> Result<(&str, &str)> {
    addr.split_once(':')
        .filter(|(proto, _)| !proto.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("address \"{addr}\" lacks a protocol prefix")))
}

/// The host part of an IP-transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Host {
    /// `*` or `[*]`: all interfaces.
    Any,
    Ip(IpAddr),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostPort {
    pub host: Host,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Any => write!(f, "*:{}", self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Name(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

impl HostPort {
    /// Parse a `host:port` tail.
    pub(crate) fn parse(tail: &str) -> Result<Self> {
        let err = || Error::InvalidInput(format!("malformed host:port \"{tail}\""));

        let (host_s, port_s) = if let Some(rest) = tail.strip_prefix('[') {
            let (inner, rest) = rest.split_once(']').ok_or_else(err)?;
            let port = rest.strip_prefix(':').ok_or_else(err)?;
            (inner, port)
        } else {
            tail.rsplit_once(':').ok_or_else(err)?
        };

        let port: u16 = port_s.parse().map_err(|_| err())?;

        let host = if host_s == "*" {
            Host::Any
        } else if let Ok(ip) = host_s.parse::<Ipv6Addr>() {
            Host::Ip(IpAddr::V6(ip))
        } else if let Ok(ip) = host_s.parse::<Ipv4Addr>() {
            Host::Ip(IpAddr::V4(ip))
        } else if !host_s.is_empty() && host_s.chars().all(is_name_char) {
            Host::Name(host_s.to_string())
        } else {
            return Err(err());
        };

        Ok(Self { host, port })
    }

    /// Resolve to a socket address. `Any` maps to the unspecified IPv4
    /// address; names go through the system resolver.
    pub(crate) fn resolve(&self) -> Result<SocketAddr> {
        match &self.host {
            Host::Any => Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))),
            Host::Ip(ip) => Ok(SocketAddr::from((*ip, self.port))),
            Host::Name(name) => (name.as_str(), self.port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| Error::NoSuchName(name.clone())),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')
}

pub(crate) fn format_ip_addr(proto: &str, hp: &HostPort) -> String {
    format!("{proto}:{hp}")
}

pub(crate) fn format_socket_addr(proto: &str, sa: &SocketAddr) -> String {
    match sa.ip() {
        IpAddr::V4(ip) => format!("{proto}:{ip}:{}", sa.port()),
        IpAddr::V6(ip) => format!("{proto}:[{ip}]:{}", sa.port()),
    }
}

/// Map a TLS-style `host:port` tail to the UX name the hybrid transport
/// pairs with it. The tail is reused verbatim in the abstract namespace.
pub(crate) fn ux_name_for_tail(tail: &str) -> String {
    format!("{UX_PROTO}:{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_protocol_prefix() {
        assert_eq!(split_proto("tcp:1.2.3.4:80").unwrap(), ("tcp", "1.2.3.4:80"));
        assert_eq!(split_proto("uxf:/run/x").unwrap(), ("uxf", "/run/x"));
        assert!(split_proto("no-colon").is_err());
        assert!(split_proto(":80").is_err());
    }

    #[test]
    fn parses_host_forms() {
        assert_eq!(
            HostPort::parse("127.0.0.1:4711").unwrap(),
            HostPort { host: Host::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)), port: 4711 }
        );
        assert_eq!(HostPort::parse("*:0").unwrap(), HostPort { host: Host::Any, port: 0 });
        assert_eq!(HostPort::parse("[*]:99").unwrap(), HostPort { host: Host::Any, port: 99 });
        assert_eq!(
            HostPort::parse("[::1]:80").unwrap(),
            HostPort { host: Host::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)), port: 80 }
        );
        assert_eq!(
            HostPort::parse("example.com:443").unwrap(),
            HostPort { host: Host::Name("example.com".into()), port: 443 }
        );
        assert!(HostPort::parse("1.2.3.4").is_err());
        assert!(HostPort::parse("host:notaport").is_err());
        assert!(HostPort::parse("ho st:80").is_err());
    }

    #[test]
    fn formats_round_trip() {
        for tail in ["10.0.0.1:80", "*:0", "[::1]:4711", "example.com:443"] {
            let hp = HostPort::parse(tail).unwrap();
            assert_eq!(HostPort::parse(&hp.to_string()).unwrap(), hp);
        }
    }
}
