//! TLS acceptor setup from PEM certificate material.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use warp_core::error::{Error, Result};

/// Build a TLS acceptor from a PEM certificate chain and private key.
///
/// rustls negotiates TLS 1.2 or newer with server-preferred AEAD suites.
/// Failures here are fatal to the daemon.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| Error::Tls {
        message: format!("failed to read cert '{}': {e}", cert_path.display()),
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| Error::Tls {
        message: format!("failed to read key '{}': {e}", key_path.display()),
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls {
            message: format!("failed to parse certificates: {e}"),
        })?;
    if certs.is_empty() {
        return Err(Error::Tls {
            message: format!("no certificates found in '{}'", cert_path.display()),
        });
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::Tls {
            message: format!("failed to parse private key: {e}"),
        })?
        .ok_or_else(|| Error::Tls {
            message: format!("no private key found in '{}'", key_path.display()),
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls {
            message: format!("invalid TLS material: {e}"),
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_fatal() {
        let err = load_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err().unwrap();
        assert!(matches!(err, Error::Tls { .. }));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let cert = dir.join("warpd-test-garbage-cert.pem");
        let key = dir.join("warpd-test-garbage-key.pem");
        std::fs::write(&cert, b"not a certificate").unwrap();
        std::fs::write(&key, b"not a key").unwrap();

        let err = load_acceptor(&cert, &key).err().unwrap();
        assert!(matches!(err, Error::Tls { .. }));

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
