//! TLS configuration, certificate loading and per-connection handshakes.
//!
//! Server configs are built on the aws-lc-rs provider explicitly, so a
//! process that links more than one rustls provider still gets a working
//! config. Client certificates are verified against a configured CA bundle
//! when the listener asks for them.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::config::{ClientAuth, TlsConfig};
use crate::net::connection::Connection;

/// Time allowed for a client to complete the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve TLS material given either as files or inline PEM.
pub async fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig, io::Error> {
    let (cert, key) = match (&tls.cert_path, &tls.key_path, &tls.cert_pem, &tls.key_pem) {
        (Some(cert), Some(key), None, None) => (
            read_pem(cert, "Certificate").await?,
            read_pem(key, "Private key").await?,
        ),
        (None, None, Some(cert), Some(key)) => (cert.as_bytes().to_vec(), key.as_bytes().to_vec()),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS needs a certificate and a key, either both as files or both inline",
            ))
        }
    };

    let client_ca = match (&tls.client_ca_path, &tls.client_ca_pem) {
        (None, None) => None,
        (Some(path), None) => Some(read_pem(path, "Client CA").await?),
        (None, Some(pem)) => Some(pem.as_bytes().to_vec()),
        (Some(_), Some(_)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client CA given both as a file and inline",
            ))
        }
    };

    let config = server_config(&cert, &key, tls.client_auth, client_ca.as_deref())?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

async fn read_pem(path: &Path, what: &str) -> io::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| io::Error::new(e.kind(), format!("{what} file {path:?}: {e}")))
}

fn server_config(cert: &[u8], key: &[u8], client_auth: ClientAuth, client_ca: Option<&[u8]>) -> io::Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let certs = parse_certs(cert)?;
    if certs.is_empty() {
        return Err(invalid_data("no certificate found in PEM"));
    }
    let key = rustls_pemfile::private_key(&mut &*key)?.ok_or_else(|| invalid_data("no private key found in PEM"))?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(invalid_data)?;
    let builder = match client_auth {
        ClientAuth::NoClientCert => builder.with_no_client_auth(),
        mode => {
            let ca = client_ca.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "client_auth requires a client CA")
            })?;
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(ca)? {
                roots.add(cert).map_err(invalid_data)?;
            }
            let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            if mode == ClientAuth::VerifyClientCertIfGiven {
                verifier = verifier.allow_unauthenticated();
            }
            builder.with_client_cert_verifier(verifier.build().map_err(invalid_data)?)
        }
    };

    let mut config = builder.with_single_cert(certs, key).map_err(invalid_data)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn parse_certs(pem: &[u8]) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &*pem).collect()
}

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Server-side TLS handshake for accepted connections.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: RustlsAcceptor,
}

impl TlsAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config).handshake_timeout(HANDSHAKE_TIMEOUT),
        }
    }

    /// Run the handshake, returning the connection with its stream encrypted.
    pub async fn accept(&self, conn: Connection) -> io::Result<Connection> {
        let (stream, mut handle) = conn.into_parts();
        let (stream, ()) = self.inner.accept(stream, ()).await?;
        handle.mark_tls();
        Ok(Connection::from_parts(stream, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_are_reported() {
        let tls = TlsConfig {
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ..TlsConfig::default()
        };
        let err = load_tls_config(&tls).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mixed_material_is_rejected() {
        let tls = TlsConfig {
            cert_path: Some("cert.pem".into()),
            key_pem: Some("key".into()),
            ..TlsConfig::default()
        };
        let err = load_tls_config(&tls).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn inline_pem_loads() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let tls = TlsConfig {
            cert_pem: Some(cert.cert.pem()),
            key_pem: Some(cert.key_pair.serialize_pem()),
            ..TlsConfig::default()
        };
        assert!(load_tls_config(&tls).await.is_ok());
    }

    #[tokio::test]
    async fn client_verification_needs_a_ca() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut tls = TlsConfig {
            cert_pem: Some(cert.cert.pem()),
            key_pem: Some(cert.key_pair.serialize_pem()),
            client_auth: ClientAuth::RequireAndVerifyClientCert,
            ..TlsConfig::default()
        };
        let err = load_tls_config(&tls).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        tls.client_ca_pem = Some(cert.cert.pem());
        assert!(load_tls_config(&tls).await.is_ok());

        tls.client_ca_pem = Some("not a certificate".into());
        assert!(load_tls_config(&tls).await.is_err());
    }
}
