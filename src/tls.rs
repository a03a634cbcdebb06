//! TLS outer transport for `vlesss` and `trojans`.
//!
//! The wrapper performs the TLS handshake first (SNI taken from the
//! URL host), then hands the encrypted stream to the inner client's
//! handshake. Certificate verification is DISABLED by default to stay
//! wire-compatible with existing deployments — a real security caveat;
//! append `?verify=true` to the URL to verify against native roots.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::addr::TargetAddr;
use crate::error::{Error, Result};
use crate::registry::{url_host_port, Client};
use crate::stream::BoxedStream;

pub struct TlsClient {
    name: &'static str,
    addr: String,
    sni: String,
    connector: TlsConnector,
    inner: Box<dyn Client>,
}

impl TlsClient {
    pub fn new(url: &Url, inner: Box<dyn Client>) -> Result<TlsClient> {
        let name = match url.scheme() {
            "vlesss" => "vlesss",
            "trojans" => "trojans",
            other => {
                return Err(Error::unsupported(format!(
                    "unknown client scheme '{}'",
                    other
                )))
            }
        };

        let addr = url_host_port(url)?;
        let sni = url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let verify = url
            .query_pairs()
            .any(|(k, v)| k == "verify" && (v == "1" || v == "true"));

        let config = if verify {
            let mut roots = RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().certs {
                roots.add(cert).ok();
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        };

        Ok(TlsClient {
            name,
            addr,
            sni,
            connector: TlsConnector::from(Arc::new(config)),
            inner,
        })
    }
}

#[async_trait]
impl Client for TlsClient {
    fn name(&self) -> &'static str {
        self.name
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, underlay: BoxedStream, target: &TargetAddr) -> Result<BoxedStream> {
        let server_name = ServerName::try_from(self.sni.clone())
            .map_err(|_| Error::config(format!("invalid SNI: {}", self.sni)))?;
        let tls = self.connector.connect(server_name, underlay).await?;
        self.inner.handshake(Box::new(tls), target).await
    }
}

/// Accepts any certificate. The bit-compatible default.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn test_tls_schemes_resolve_to_wrapper() {
        let registry = Registry::new();
        let client = registry
            .client("trojans://password@relay.example:443")
            .unwrap();
        assert_eq!(client.name(), "trojans");
        assert_eq!(client.addr(), "relay.example:443");

        let client = registry
            .client("vlesss://b831381d-6324-4d53-ad4f-8cda48b30811@10.0.0.2:8443")
            .unwrap();
        assert_eq!(client.name(), "vlesss");
        assert_eq!(client.addr(), "10.0.0.2:8443");
    }

    #[test]
    fn test_inner_credential_still_required() {
        // The stripped-scheme client keeps its own validation.
        let registry = Registry::new();
        assert!(registry.client("trojans://relay.example:443").is_err());
        assert!(registry.client("vlesss://not-a-uuid@relay.example:443").is_err());
    }

    #[test]
    fn test_verify_flag_accepted() {
        let registry = Registry::new();
        assert!(registry
            .client("trojans://password@relay.example:443?verify=true")
            .is_ok());
    }
}
