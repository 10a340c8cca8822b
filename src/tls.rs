//! Certificate loading and mTLS configuration for the resource channel.
//!
//! The queue dials resources as a TLS client and each resource serves its
//! dispatcher as a TLS server; both sides present a certificate signed by
//! the shared CA.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Name checked against the resource's certificate. Resources are dialed by
/// arbitrary host or IP, so trust comes from the CA rather than the hostname.
pub const RESOURCE_DOMAIN: &str = "cracklord-resource";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("TLS is enabled but incomplete and insecure mode is not allowed")]
    Incomplete,

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded PEM material ready for tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

/// Read one PEM file, distinguishing an unset path from a missing file.
async fn read_pem(
    path: Option<&PathBuf>,
    unset: TlsError,
    absent: fn(PathBuf) -> TlsError,
) -> Result<Vec<u8>, TlsError> {
    let path = path.ok_or(unset)?;
    if !path.exists() {
        return Err(absent(path.clone()));
    }
    Ok(fs::read(path).await?)
}

impl TlsIdentity {
    /// Load the CA, certificate and key named by `config`, CA first.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca = read_pem(
            config.ca_cert_path.as_ref(),
            TlsError::MissingCaCert,
            TlsError::CaCertNotFound,
        )
        .await?;
        let cert = read_pem(
            config.cert_path.as_ref(),
            TlsError::MissingCert,
            TlsError::CertNotFound,
        )
        .await?;
        let key = read_pem(
            config.key_path.as_ref(),
            TlsError::MissingKey,
            TlsError::KeyNotFound,
        )
        .await?;

        Ok(Self {
            identity: Identity::from_pem(cert, key),
            ca_cert: Certificate::from_pem(ca),
        })
    }

    /// Resolve a config into an identity, or `None` for plaintext.
    ///
    /// Enabled but incomplete settings are an error unless `allow_insecure`
    /// is set, in which case the channel falls back to plaintext with a
    /// warning.
    pub async fn from_config(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.enabled {
            return Ok(None);
        }
        if config.is_complete() {
            return Self::load(config).await.map(Some);
        }
        if config.allow_insecure {
            tracing::warn!("TLS enabled but certificate paths are missing, running in plaintext");
            return Ok(None);
        }
        Err(TlsError::Incomplete)
    }

    /// Dispatcher side: only queues holding a CA-signed certificate may call.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        let TlsIdentity { identity, ca_cert } = self.clone();
        ServerTlsConfig::new().identity(identity).client_ca_root(ca_cert)
    }

    /// Queue side: the resource must present a CA-signed certificate
    /// issued for [`RESOURCE_DOMAIN`].
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        let TlsIdentity { identity, ca_cert } = self.clone();
        ClientTlsConfig::new()
            .domain_name(RESOURCE_DOMAIN)
            .ca_certificate(ca_cert)
            .identity(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_reports_missing_ca_first() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCaCert)));
    }

    #[tokio::test]
    async fn load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/node.crt")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            allow_insecure: false,
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[tokio::test]
    async fn load_checks_the_key_after_the_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("queue.pem");
        std::fs::write(&ca, b"ca").unwrap();
        std::fs::write(&cert, b"cert").unwrap();

        let mut config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(ca),
            cert_path: Some(cert),
            ..Default::default()
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::MissingKey)
        ));

        config.key_path = Some(dir.path().join("absent.key"));
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn disabled_tls_is_plaintext() {
        let result = TlsIdentity::from_config(&TlsConfig::default()).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn incomplete_tls_needs_insecure_flag() {
        let mut config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            TlsIdentity::from_config(&config).await,
            Err(TlsError::Incomplete)
        ));

        config.allow_insecure = true;
        assert!(matches!(TlsIdentity::from_config(&config).await, Ok(None)));
    }
}
