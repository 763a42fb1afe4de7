use std::{fs::File, io, io::BufReader, sync::Arc};

use rustls::{
    crypto::ring::default_provider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    ClientConfig, RootCertStore, ServerConfig,
};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::{config::TlsConfig, error::TransportError};

const DEFAULT_SERVER_NAME: &str = "localhost";

/// Acceptor and connector built from PEM files.
#[derive(Clone)]
pub(crate) struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Returns `None` when TLS is disabled.
    pub(crate) fn from_config(cfg: &TlsConfig) -> Result<Option<Self>, TransportError> {
        if !cfg.enabled {
            return Ok(None);
        }
        let (Some(cert_path), Some(key_path)) = (&cfg.cert_path, &cfg.key_path) else {
            return Err(TransportError::Tls(
                "cert_path and key_path are required".to_string(),
            ));
        };

        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut roots = RootCertStore::empty();
        // Without a CA bundle, peers are expected to present our own
        // certificate.
        let anchors = match &cfg.ca_path {
            Some(ca_path) => load_certs(ca_path)?,
            None => certs.clone(),
        };
        for cert in anchors {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("invalid CA certificate: {e}")))?;
        }

        let provider = Arc::new(default_provider());
        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("invalid certificate or key: {e}")))?;

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = cfg
            .server_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name {name:?}")))?;

        Ok(Some(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        }))
    }

    pub(crate) async fn accept(&self, stream: TcpStream) -> io::Result<server::TlsStream<TcpStream>> {
        self.acceptor.accept(stream).await
    }

    pub(crate) async fn connect(&self, stream: TcpStream) -> io::Result<client::TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

fn open(path: &str) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::Tls(format!("failed to open {path}: {e}")))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificates in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TransportError::Tls(format!("failed to parse key in {path}: {e}")))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tls_builds_nothing() {
        assert!(TlsContext::from_config(&TlsConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_files_are_reported() {
        let cfg = TlsConfig {
            enabled: true,
            cert_path: Some("/nonexistent/cert.pem".to_string()),
            key_path: Some("/nonexistent/key.pem".to_string()),
            ..Default::default()
        };
        let err = TlsContext::from_config(&cfg).err().unwrap();
        assert!(matches!(err, TransportError::Tls(msg) if msg.contains("cert.pem")));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let dir = std::env::temp_dir().join(format!("kv-mesh-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "").unwrap();

        let err = load_certs(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, TransportError::Tls(msg) if msg.contains("no certificates")));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
