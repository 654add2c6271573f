//! Backend TLS trust configuration.
//!
//! Builds the two `rustls::ClientConfig`s a [`ProxyConfig`](crate::config::ProxyConfig)
//! can select between via `verify_tls`: the default webpki-rooted config, and an
//! insecure one that accepts any server certificate. Grounded on
//! `agentgateway`'s `transport::tls::insecure` module.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

/// Accepts any server certificate without validation. Used only when a
/// mount is configured with `verify_tls: false`; never the default.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn default_root_store() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the `ring` crypto provider as the process default, if one
/// hasn't already been installed. Several of our dependencies (and their
/// transitive rustls pulls) may compile in more than one provider; rustls
/// only auto-selects when exactly one is linked, so we pin it explicitly
/// the way `agentgateway`'s `transport::tls::provider` does.
fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the TLS client config a mount should use, per its `verify_tls`
/// setting. Called once at mount time; the result is shared via `Arc`
/// across every connection the mount opens (pooled and one-shot alike).
pub fn build_client_config(verify_tls: bool) -> Arc<ClientConfig> {
    ensure_crypto_provider();
    if verify_tls {
        let roots = default_root_store();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    } else {
        let mut cfg = ClientConfig::builder()
            .with_root_certificates(default_root_store())
            .with_no_client_auth();
        cfg.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
        Arc::new(cfg)
    }
}
