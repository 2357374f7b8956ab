//! TLS context builder
//!
//! Builds rustls server/client configurations for the two HTTP/2 TLS
//! endpoints this gateway terminates or originates. Loading certificate
//! and key material off disk is the bootstrap/CLI's job (an external
//! collaborator per scope); this module only turns already-parsed
//! material into negotiation parameters.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

const ALPN_H2: &[u8] = b"h2";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to build server TLS config: {0}")]
    Server(String),

    #[error("failed to build client TLS config: {0}")]
    Client(String),

    #[error("no cipher suite in the default provider matched \"{0}\"")]
    NoMatchingCipherSuite(String),
}

/// Build the server-side TLS config: ALPN restricted to `h2`, TLS 1.2
/// and 1.3 only (rustls never negotiates 1.0/1.1 or compression, so
/// those two restrictions from spec section 4.F are the crate's
/// default behavior), and ciphers filtered down to ones matching
/// `cipher_spec` (an OpenSSL-style string such as `"ECDHE+AESGCM"`).
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cipher_spec: &str,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = filtered_provider(cipher_spec)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| TlsError::Server(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Server(e.to_string()))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

/// Build the client-side TLS config used by the stub's upstream HTTP/2
/// connection. In "insecure" mode, certificate verification is disabled
/// entirely (matching the original `--insecure` flag); otherwise the
/// default webpki-roots verifier is used, augmented with an optional
/// extra trusted CA.
pub fn build_client_config(
    insecure: bool,
    extra_ca: Option<Vec<CertificateDer<'static>>>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(extra) = extra_ca {
            for cert in extra {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Client(e.to_string()))?;
            }
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

/// Parse `spec` (tokens joined by `+` or `:`, OpenSSL cipher-list style)
/// and keep only cipher suites from the default ring provider whose
/// debug name contains every token. This is an approximation — rustls
/// suite names (`TLS13_AES_256_GCM_SHA384`) don't line up one-to-one
/// with OpenSSL's (`ECDHE+AESGCM`) — see DESIGN.md.
fn filtered_provider(spec: &str) -> Result<rustls::crypto::CryptoProvider, TlsError> {
    let base = rustls::crypto::ring::default_provider();
    let tokens: Vec<String> = spec
        .split(|c| c == '+' || c == ':')
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.is_empty() {
        return Ok(base);
    }

    let matched: Vec<_> = base
        .cipher_suites
        .iter()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite()).to_uppercase();
            tokens.iter().all(|tok| name.contains(normalize_token(tok)))
        })
        .cloned()
        .collect();

    if matched.is_empty() {
        return Err(TlsError::NoMatchingCipherSuite(spec.to_string()));
    }

    Ok(rustls::crypto::CryptoProvider {
        cipher_suites: matched,
        ..base
    })
}

fn normalize_token(token: &str) -> &str {
    match token {
        "AESGCM" => "GCM",
        other => other,
    }
}

/// Disables certificate verification entirely, for `stub_insecure`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
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

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;

    fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let cert = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der =
            PrivateKeyDer::try_from(cert.signing_key.serialize_der()).expect("valid key der");
        (vec![cert_der], key_der)
    }

    #[test]
    fn server_config_sets_h2_alpn() {
        let (certs, key) = self_signed();
        let config = build_server_config(certs, key, "ECDHE+AESGCM").unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[test]
    fn server_config_rejects_unmatched_cipher_spec() {
        let (certs, key) = self_signed();
        let result = build_server_config(certs, key, "NOT+A+REAL+CIPHER");
        assert!(result.is_err());
    }

    #[test]
    fn client_config_sets_h2_alpn() {
        let config = build_client_config(false, None).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[test]
    fn insecure_client_config_also_sets_alpn() {
        let config = build_client_config(true, None).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H2.to_vec()]);
    }
}
