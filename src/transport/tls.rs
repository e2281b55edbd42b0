//! TLS material for the secure acceptor and outbound deliverers.
//!
//! Both directions use mutual TLS anchored at one configured CA: the acceptor
//! requires and verifies a client certificate, deliverers present the same
//! certificate when dialing a peer.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::utils::error::GatewayError;

pub const DEFAULT_SERVER_NAME: &str = "gateway";

#[derive(Clone)]
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Load CA, certificate and key from PEM files.
    pub fn load(
        ca: impl AsRef<Path>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        server_name: &str,
    ) -> Result<Self, GatewayError> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| GatewayError::Tls(format!("cannot read {}: {e}", path.display())))
        };
        Self::from_pem(
            &read(ca.as_ref())?,
            &read(cert.as_ref())?,
            &read(key.as_ref())?,
            server_name,
        )
    }

    pub fn from_pem(
        ca_pem: &[u8],
        cert_pem: &[u8],
        key_pem: &[u8],
        server_name: &str,
    ) -> Result<Self, GatewayError> {
        let ca_certs = parse_certificates(ca_pem)?;
        if ca_certs.is_empty() {
            return Err(GatewayError::Tls("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| GatewayError::Tls(format!("failed to add CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(GatewayError::Tls("no certificates found".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| GatewayError::Tls(format!("failed to parse private key: {e}")))?;

        let client = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| GatewayError::Tls(format!("client config error: {e}")))?;

        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| GatewayError::Tls(format!("client verifier error: {e}")))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Tls(format!("server config error: {e}")))?;

        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| GatewayError::Tls(format!("invalid server name: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
            server_name,
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("failed to parse certificates: {e}")))
}
