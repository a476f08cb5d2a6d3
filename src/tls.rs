//! TLS termination for the HTTP front end.

use std::{io, path::Path, sync::Arc};

use tokio_rustls::{
    rustls::{
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

use crate::Result;

/// Builds an acceptor from a PEM certificate chain and a PEM private key.
///
/// # Errors
/// [`WebSocketError::IoError`](crate::WebSocketError::IoError) when a file cannot be read or
/// contains no certificate or key, [`WebSocketError::Tls`](crate::WebSocketError::Tls) when
/// rustls rejects the pair.
pub fn load_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_key(key_path.as_ref())?;

    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice()).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(invalid_data(format!("no certificate in {}", path.display())).into());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())?
        .ok_or_else(|| invalid_data(format!("no private key in {}", path.display())).into())
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
