//! TLS client configuration for the tunnel.
//!
//! The inner handshake offers only `h2`; the outer `wss` handshake uses a
//! separate configuration without ALPN so the WebSocket upgrade stays on
//! HTTP/1.1.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use burrow_core::TunnelEndpoint;
use burrow_core::config::TlsSettings;

use super::error::{DialError, TlsSetupError};

/// ALPN identifier the tunnel must negotiate.
pub const H2_ALPN: &[u8] = b"h2";

/// Client configuration for the inner, `h2`-only handshake.
pub fn tunnel_client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let mut config = base_config(settings)?;
    config.alpn_protocols = vec![H2_ALPN.to_vec()];
    Ok(Arc::new(config))
}

/// Client configuration for the outer `wss` connection.
pub fn outer_client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, TlsSetupError> {
    Ok(Arc::new(base_config(settings)?))
}

fn base_config(settings: &TlsSettings) -> Result<ClientConfig, TlsSetupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if settings.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(settings.ca_cert_path.as_deref())?)
            .with_no_client_auth()
    };
    Ok(config)
}

fn root_store(ca_path: Option<&Path>) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let Some(path) = ca_path else {
        return Ok(roots);
    };

    let bundle_err = |message: String| TlsSetupError::CaBundle {
        path: path.to_path_buf(),
        message,
    };
    let mut added = 0usize;
    for cert in CertificateDer::pem_file_iter(path).map_err(|e| bundle_err(e.to_string()))? {
        roots.add(cert.map_err(|e| bundle_err(e.to_string()))?)?;
        added += 1;
    }
    if added == 0 {
        return Err(bundle_err("no certificates found".into()));
    }
    Ok(roots)
}

/// TLS server name for `endpoint`: the override when set, else the endpoint
/// host without port or IPv6 brackets.
pub fn server_name(
    endpoint: &TunnelEndpoint,
    settings: &TlsSettings,
) -> Result<ServerName<'static>, TlsSetupError> {
    let host = settings
        .server_name
        .clone()
        .unwrap_or_else(|| endpoint.host().to_string());
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    ServerName::try_from(host.clone()).map_err(|_| TlsSetupError::ServerName(host))
}

/// Classify a failed client handshake into a dial phase.
pub fn handshake_error(err: &io::Error) -> DialError {
    let rustls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match rustls_err {
        Some(e @ rustls::Error::InvalidCertificate(_)) => DialError::verify(e.to_string()),
        Some(rustls::Error::NoApplicationProtocol) => DialError::protocol(
            "protocol negotiation mismatch: could not negotiate protocol mutually",
        ),
        _ => DialError::handshake(err.to_string()),
    }
}

/// Require `h2` to have been negotiated.
pub fn check_alpn(negotiated: Option<&[u8]>) -> Result<(), DialError> {
    match negotiated {
        Some(proto) if proto == H2_ALPN => Ok(()),
        Some(proto) => Err(DialError::protocol(format!(
            "protocol negotiation mismatch: unexpected ALPN protocol {:?}; want \"h2\"",
            String::from_utf8_lossy(proto)
        ))),
        None => Err(DialError::protocol(
            "protocol negotiation mismatch: could not negotiate protocol mutually",
        )),
    }
}

/// Accepts any server certificate. Only used with `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
