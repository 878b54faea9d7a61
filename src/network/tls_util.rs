//! TLS helper functions.
//!
//! Loading of PEM certificates and keys, and construction of the
//! `rustls` configurations used by the two endpoints:
//!
//! * the frontend serves clients with server-only authentication;
//! * the connection between the notary server and the signing
//!   service is mutually authenticated, each side checking the
//!   other's certificate against a configured CA.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certfile = fs::File::open(path)
        .map_err(|e| anyhow!("cannot open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(certfile);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.  PKCS#8, PKCS#1 and
/// SEC1 encodings are accepted.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let keyfile = fs::File::open(path)
        .map_err(|e| anyhow!("cannot open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(keyfile);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

pub fn load_root_store(ca_path: &Path) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        root_store.add(cert)?;
    }
    Ok(root_store)
}

/// Client configuration trusting `roots` and presenting the given
/// certificate chain.
pub fn client_config(
    roots: RootCertStore,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// [`client_config`] from PEM files.
pub fn make_client_config(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<Arc<ClientConfig>> {
    client_config(
        load_root_store(ca_path)?,
        load_certs(cert_path)?,
        load_private_key(key_path)?,
    )
}

/// Server configuration.  With `client_roots` every client must
/// present a certificate chaining to one of them; without, client
/// authentication is not requested.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
) -> Result<Arc<ServerConfig>> {
    let builder = ServerConfig::builder();
    let config = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(Arc::new(config))
}

/// [`server_config`] from PEM files.
pub fn make_server_config(cert_path: &Path, key_path: &Path, client_ca_path: Option<&Path>) -> Result<Arc<ServerConfig>> {
    let client_roots = client_ca_path.map(load_root_store).transpose()?;
    server_config(load_certs(cert_path)?, load_private_key(key_path)?, client_roots)
}
