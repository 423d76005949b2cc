use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, OtherError, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::matcher::is_matched;

/// The leaf certificate does not name the expected host
#[derive(Debug, thiserror::Error)]
#[error("certificate is not valid for {expected}: presented {presented:?}")]
pub struct HostnameMismatch {
    pub expected: String,
    pub presented: Vec<String>,
}

/// The leaf certificate could not be decoded
#[derive(Debug, thiserror::Error)]
#[error("unable to parse server certificate: {0}")]
pub struct UnparsableCertificate(String);

/// Identities carried by a certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentities {
    /// DNS-type subject alternative names
    pub dns_names: Vec<String>,

    /// Common Name attributes of the subject, in certificate order
    pub common_names: Vec<String>,
}

impl CertIdentities {
    /// Extract DNS SANs and subject CNs from a DER encoded certificate
    pub fn from_der(der: &CertificateDer<'_>) -> Result<Self, UnparsableCertificate> {
        let (_, cert) = X509Certificate::from_der(der.as_ref())
            .map_err(|e| UnparsableCertificate(e.to_string()))?;

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(UnparsableCertificate(e.to_string())),
        };

        let common_names = cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok().map(str::to_string))
            .collect();

        Ok(Self {
            dns_names,
            common_names,
        })
    }

    /// Check `hostname` against these identities
    ///
    /// DNS SANs win outright when present; the subject CN is only consulted
    /// for certificates that carry no DNS SAN at all, and then only the most
    /// specific (last) one.
    pub fn check(&self, hostname: &str) -> Result<(), HostnameMismatch> {
        let matched = if !self.dns_names.is_empty() {
            self.dns_names.iter().any(|san| is_matched(hostname, san))
        } else {
            self.common_names
                .last()
                .map(|cn| is_matched(hostname, cn))
                .unwrap_or(false)
        };

        if matched {
            Ok(())
        } else {
            let presented = if self.dns_names.is_empty() {
                self.common_names.clone()
            } else {
                self.dns_names.clone()
            };
            Err(HostnameMismatch {
                expected: hostname.to_string(),
                presented,
            })
        }
    }
}

/// Whether a delegate error only concerns the presented names
///
/// The delegate checks the chain before the name, so such an error means the
/// chain itself was accepted.
fn is_name_error(error: &Error) -> bool {
    matches!(
        error,
        Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

/// Certificate verifier pinned to one hostname
///
/// Chain validation is delegated. Name errors from the delegate are ignored
/// and the leaf is checked against the fixed expected hostname by
/// [`is_matched`], no matter which address the socket was opened against or
/// what name the handshake was started with.
#[derive(Debug)]
pub struct HostnameVerifier {
    expected: String,
    expected_name: ServerName<'static>,
    delegate: Arc<dyn ServerCertVerifier>,
}

impl HostnameVerifier {
    /// Wrap `delegate`, pinning every handshake to `expected`
    pub fn new(
        expected: impl Into<String>,
        delegate: Arc<dyn ServerCertVerifier>,
    ) -> Result<Self, Error> {
        let expected = expected.into();
        let expected_name = ServerName::try_from(expected.clone())
            .map_err(|_| Error::General(format!("invalid expected hostname {:?}", expected)))?;

        Ok(Self {
            expected,
            expected_name,
            delegate,
        })
    }

    pub fn expected_hostname(&self) -> &str {
        &self.expected
    }

    /// Hostname check on its own, without chain validation
    pub fn check_hostname(&self, end_entity: &CertificateDer<'_>) -> Result<(), Error> {
        let identities = CertIdentities::from_der(end_entity).map_err(|e| {
            Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(e))))
        })?;

        identities.check(&self.expected).map_err(|mismatch| {
            warn!(
                expected = %mismatch.expected,
                presented = ?mismatch.presented,
                "server certificate hostname mismatch"
            );
            Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(mismatch))))
        })
    }
}

impl ServerCertVerifier for HostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        if server_name != &self.expected_name {
            debug!(
                presented = ?server_name,
                expected = %self.expected,
                "handshake server name differs from pinned hostname"
            );
        }

        match self.delegate.verify_server_cert(
            end_entity,
            intermediates,
            &self.expected_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => {}
            Err(e) if is_name_error(&e) => {
                debug!(error = %e, "delegate name check overridden by hostname matcher");
            }
            Err(e) => return Err(e),
        }

        self.check_hostname(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.delegate.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.delegate.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.delegate.supported_verify_schemes()
    }
}
