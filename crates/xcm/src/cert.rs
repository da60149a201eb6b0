//! TLS certificate material discovery and loading.
//!
//! Material lives in a per-network-namespace directory:
//! `cert_<ns>.pem`, `key_<ns>.pem`, `tc_<ns>.pem`, with the `_<ns>`
//! suffix dropped in the default namespace. The directory defaults to
//! `/etc/xcm/tls` and is overridable with `XCM_TLS_CERT`.
//!
//! Configurations are cached per process and rebuilt only when the file
//! *contents* change, so certificate rotation via an atomic symlink swap
//! is picked up without a restart.

use std::{
    fs, io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use once_cell::sync::Lazy;
use rustls::{ClientConfig, RootCertStore, ServerConfig, server::WebPkiClientVerifier};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub(crate) const CERT_DIR_ENV: &str = "XCM_TLS_CERT";
const DEFAULT_CERT_DIR: &str = "/etc/xcm/tls";

#[derive(Clone, Debug)]
pub(crate) struct TlsConfigs {
    pub client: Arc<ClientConfig>,
    pub server: Arc<ServerConfig>,
}

struct Cached {
    dir: PathBuf,
    cert: Vec<u8>,
    key: Vec<u8>,
    tc: Vec<u8>,
    configs: TlsConfigs,
}

static CACHE: Lazy<Mutex<Option<Cached>>> = Lazy::new(|| Mutex::new(None));

pub(crate) fn cert_dir() -> PathBuf {
    std::env::var_os(CERT_DIR_ENV).map_or_else(|| PathBuf::from(DEFAULT_CERT_DIR), PathBuf::from)
}

/// Name of the network namespace this process runs in, if it is a named
/// one. Found by matching `/proc/self/ns/net` against `/run/netns`.
fn self_net_ns() -> Option<String> {
    let self_ino = fs::metadata("/proc/self/ns/net").ok()?.ino();
    for entry in fs::read_dir("/run/netns").ok()? {
        let entry = entry.ok()?;
        if fs::metadata(entry.path()).is_ok_and(|m| m.ino() == self_ino) {
            return entry.file_name().into_string().ok();
        }
    }
    None
}

fn file_name(stem: &str, ns: Option<&str>) -> String {
    match ns {
        Some(ns) => format!("{stem}_{ns}.pem"),
        None => format!("{stem}.pem"),
    }
}

fn read_material(dir: &Path, stem: &str, ns: Option<&str>) -> Result<Vec<u8>> {
    let path = dir.join(file_name(stem, ns));
    fs::read(&path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            Error::ProtocolError(format!("missing TLS material {}", path.display()))
        } else {
            Error::from_io(&err)
        }
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut &pem[..]).collect();
    let certs = certs.map_err(|e| Error::ProtocolError(format!("bad certificate file: {e}")))?;
    if certs.is_empty() {
        return Err(Error::ProtocolError("certificate file holds no certificates".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::ProtocolError(format!("bad key file: {e}")))?
        .ok_or_else(|| Error::ProtocolError("key file holds no private key".into()))
}

fn build_configs(cert: &[u8], key: &[u8], tc: &[u8]) -> Result<TlsConfigs> {
    let cert_chain = parse_certs(cert)?;
    let trust = parse_certs(tc)?;

    let mut roots = RootCertStore::empty();
    for c in trust {
        roots
            .add(c)
            .map_err(|e| Error::ProtocolError(format!("bad trust-chain certificate: {e}")))?;
    }
    let roots = Arc::new(roots);

    let client = ClientConfig::builder()
        .with_root_certificates(roots.clone())
        .with_client_auth_cert(cert_chain.clone(), parse_key(key)?)
        .map_err(|e| Error::ProtocolError(format!("bad client credentials: {e}")))?;

    let verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| Error::ProtocolError(format!("bad client verifier roots: {e}")))?;
    let server = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, parse_key(key)?)
        .map_err(|e| Error::ProtocolError(format!("bad server credentials: {e}")))?;

    Ok(TlsConfigs { client: Arc::new(client), server: Arc::new(server) })
}

pub(crate) fn load_from_dir(dir: &Path) -> Result<TlsConfigs> {
    let ns = self_net_ns();
    let ns = ns.as_deref();

    let cert = read_material(dir, "cert", ns)?;
    let key = read_material(dir, "key", ns)?;
    let tc = read_material(dir, "tc", ns)?;

    let mut cache = CACHE.lock().unwrap();
    if let Some(cached) = cache.as_ref() {
        if cached.dir == dir && cached.cert == cert && cached.key == key && cached.tc == tc {
            return Ok(cached.configs.clone());
        }
        debug!(dir = %dir.display(), "TLS material changed, rebuilding");
    }

    let configs = build_configs(&cert, &key, &tc).inspect_err(|err| {
        warn!(dir = %dir.display(), %err, "TLS configuration rejected");
    })?;
    *cache = Some(Cached { dir: dir.to_path_buf(), cert, key, tc, configs: configs.clone() });
    Ok(configs)
}

/// Load (or reuse) the TLS configurations for the current certificate
/// directory. A missing file is a protocol error at socket creation.
pub(crate) fn load() -> Result<TlsConfigs> {
    load_from_dir(&cert_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_suffix_selects_file_names() {
        assert_eq!(file_name("cert", None), "cert.pem");
        assert_eq!(file_name("tc", Some("left")), "tc_left.pem");
    }

    #[test]
    fn missing_material_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        match load_from_dir(dir.path()) {
            Err(Error::ProtocolError(msg)) => assert!(msg.contains("missing TLS material")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn garbage_material_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["cert", "key", "tc"] {
            fs::write(dir.path().join(format!("{stem}.pem")), b"not pem").unwrap();
        }
        assert!(matches!(load_from_dir(dir.path()), Err(Error::ProtocolError(_))));
    }
}
