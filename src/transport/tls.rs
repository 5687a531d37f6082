//! TLS client and server wrappers.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};
use tracing::debug;

/// Client side TLS, trusting the webpki root set.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> Self {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Runs the client handshake over an established TCP connection.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> io::Result<client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid server name {server_name:?}"),
            )
        })?;

        let tls = self.connector.connect(name, stream).await?;
        debug!("TLS connection established to {}", server_name);

        Ok(tls)
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side TLS with a fixed certificate chain loaded from PEM files.
#[derive(Clone)]
pub struct TlsListener {
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn from_pem(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no certificates in {}", cert_path.display()),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no private key in {}", key_path.display()),
                )
            })?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> io::Result<server::TlsStream<TcpStream>> {
        self.acceptor.accept(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pem_missing_files_is_error() {
        let err = TlsListener::from_pem(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err()
        .unwrap();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn from_pem_without_certificates_is_error() {
        let dir = std::env::temp_dir();
        let cert = dir.join(format!("misha-empty-cert-{}.pem", std::process::id()));
        std::fs::write(&cert, "not a pem file\n").unwrap();

        let err = TlsListener::from_pem(&cert, &cert).err().unwrap();
        let _ = std::fs::remove_file(&cert);

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_server_name() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let err = TlsDialer::new().connect("bad name!", stream).await.err().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
