//! TLS client configuration pinned to a single hostname
//!
//! Connections are opened against raw IP addresses, so the usual "verify the
//! name we dialed" rule would either fail or verify the wrong thing. Instead
//! every handshake sends the logical hostname as SNI and the
//! [`HostnameVerifier`] checks the leaf certificate against that same fixed
//! name after the webpki chain verifier has accepted the chain.

pub mod matcher;
pub mod verifier;

pub use matcher::is_matched;
pub use verifier::{CertIdentities, HostnameMismatch, HostnameVerifier};

use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::TlsConfig;

/// Errors raised while assembling the TLS client configuration
#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read CA file {path:?}: {source}")]
    CaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CA file {0:?} contains no usable certificates")]
    NoCertificates(PathBuf),

    #[error("no trust anchors configured")]
    NoTrustAnchors,

    #[error("failed to build certificate verifier: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Crypto provider used for every client configuration
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate in a PEM file into `roots`
pub fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<usize, TlsSetupError> {
    let file = File::open(path).map_err(|source| TlsSetupError::CaFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::CaFile {
            path: path.to_path_buf(),
            source,
        })?;

    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!(path = %path.display(), added, ignored, "loaded CA certificates");
    if added == 0 {
        return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
    }
    Ok(added)
}

/// Trust anchors described by the configuration
pub fn root_store(config: &TlsConfig) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    if config.webpki_roots {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    if let Some(path) = &config.ca_file {
        add_pem_roots(&mut roots, path)?;
    }
    if roots.is_empty() {
        return Err(TlsSetupError::NoTrustAnchors);
    }
    Ok(roots)
}

/// Client configuration whose verifier is pinned to `hostname`
pub fn client_config(
    hostname: &str,
    roots: RootCertStore,
) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let provider = crypto_provider();
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()?;
    let verifier = HostnameVerifier::new(hostname, webpki)?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
