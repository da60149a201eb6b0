//! Socket attribute surface.
//!
//! Attributes are typed values keyed by dotted name. The generic
//! `xcm.*` set is implemented once, here, reading from the socket fields
//! and counters; transports extend it with their own sets, reached
//! through the [`Transport`](crate::tp::Transport) vtable.

use crate::{
    cnt::ConnCnt,
    error::{Error, Result},
    tp::{SocketKind, TpSocket},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Bool,
    Int,
    Str,
    Bin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bin(Vec<u8>),
}

impl AttrValue {
    pub fn ty(&self) -> AttrType {
        match self {
            Self::Bool(_) => AttrType::Bool,
            Self::Int(_) => AttrType::Int,
            Self::Str(_) => AttrType::Str,
            Self::Bin(_) => AttrType::Bin,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Name, type and writability of one attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
    pub name: &'static str,
    pub ty: AttrType,
    pub writable: bool,
}

impl AttrSpec {
    pub(crate) const fn ro(name: &'static str, ty: AttrType) -> Self {
        Self { name, ty, writable: false }
    }

    pub(crate) const fn rw(name: &'static str, ty: AttrType) -> Self {
        Self { name, ty, writable: true }
    }
}

/// An ordered set of attribute writes, applied in insertion order between
/// transport initialization and the connect/bind/accept step.
#[derive(Debug, Default, Clone)]
pub struct AttrMap {
    entries: Vec<(String, AttrValue)>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.entries.push((name.to_string(), value.into()));
        self
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

const COMMON_ATTRS: &[AttrSpec] = &[
    AttrSpec::rw("xcm.blocking", AttrType::Bool),
    AttrSpec::ro("xcm.type", AttrType::Str),
    AttrSpec::ro("xcm.transport", AttrType::Str),
    AttrSpec::ro("xcm.local_addr", AttrType::Str),
];

const CONN_ATTRS: &[AttrSpec] = &[
    AttrSpec::ro("xcm.remote_addr", AttrType::Str),
    AttrSpec::ro("xcm.max_msg_size", AttrType::Int),
];

type CntGet = fn(&ConnCnt) -> i64;

/// Counter attributes, one getter table instead of per-counter functions.
const CNT_ATTRS: &[(&str, CntGet)] = &[
    ("xcm.from_app_msgs", |c| c.from_app.msgs),
    ("xcm.from_app_bytes", |c| c.from_app.bytes),
    ("xcm.to_app_msgs", |c| c.to_app.msgs),
    ("xcm.to_app_bytes", |c| c.to_app.bytes),
    ("xcm.from_lower_msgs", |c| c.from_lower.msgs),
    ("xcm.from_lower_bytes", |c| c.from_lower.bytes),
    ("xcm.to_lower_msgs", |c| c.to_lower.msgs),
    ("xcm.to_lower_bytes", |c| c.to_lower.bytes),
];

fn get_generic(s: &TpSocket, name: &str) -> Option<Result<AttrValue>> {
    let value = match name {
        "xcm.blocking" => AttrValue::Bool(s.core.blocking),
        "xcm.type" => AttrValue::Str(s.core.kind.name().to_string()),
        "xcm.transport" => AttrValue::Str(s.transport_tag().to_string()),
        "xcm.local_addr" => match s.tp.local_addr() {
            Some(addr) => AttrValue::Str(addr),
            None => return Some(Err(Error::NoEntry)),
        },
        "xcm.remote_addr" if s.core.kind == SocketKind::Connection => {
            match s.tp.remote_addr() {
                Some(addr) => AttrValue::Str(addr),
                None => return Some(Err(Error::NoEntry)),
            }
        }
        "xcm.max_msg_size" if s.core.kind == SocketKind::Connection => {
            AttrValue::Int(s.tp.max_msg() as i64)
        }
        _ => {
            if s.core.kind == SocketKind::Connection {
                let (_, getter) = CNT_ATTRS.iter().find(|(n, _)| *n == name)?;
                AttrValue::Int(getter(s.counters()))
            } else {
                return None;
            }
        }
    };
    Some(Ok(value))
}

/// Read one attribute, generic set first, transport set second.
pub(crate) fn get(s: &TpSocket, name: &str) -> Result<AttrValue> {
    match get_generic(s, name) {
        Some(res) => res,
        None => s.tp.get_attr(&s.core, name),
    }
}

/// Write one attribute.
pub(crate) fn set(s: &mut TpSocket, name: &str, value: &AttrValue) -> Result<()> {
    match name {
        "xcm.blocking" => {
            let blocking =
                value.as_bool().ok_or_else(|| Error::InvalidInput("expected bool".into()))?;
            s.core.blocking = blocking;
            Ok(())
        }
        // Binding a connecting socket before connect is out of contract,
        // so no transport accepts a local-address write.
        "xcm.local_addr" => {
            let local_addr =
                value.as_str().ok_or_else(|| Error::InvalidInput("expected string".into()))?;
            s.tp.set_local_addr(local_addr)
        }
        _ if get_generic(s, name).is_some() => Err(Error::AccessDenied),
        _ => s.tp.set_attr(&mut s.core, name, value),
    }
}

/// Specs for every attribute this socket carries, generic then transport.
pub(crate) fn specs(s: &TpSocket) -> Vec<AttrSpec> {
    let mut out: Vec<AttrSpec> = COMMON_ATTRS.to_vec();
    if s.core.kind == SocketKind::Connection {
        out.extend_from_slice(CONN_ATTRS);
        out.extend(CNT_ATTRS.iter().map(|&(name, _)| AttrSpec::ro(name, AttrType::Int)));
    }
    out.extend(s.tp.attr_specs(s.core.kind));
    out
}

/// Enumerate name/value pairs. Attributes whose value is currently
/// unavailable (e.g. no address yet) are skipped.
pub(crate) fn visit_all(s: &TpSocket, f: &mut dyn FnMut(&str, &AttrValue)) {
    for spec in specs(s) {
        if let Ok(value) = get(s, spec.name) {
            f(spec.name, &value);
        }
    }
}
