//! TLS policy: the crypto provider, protocol versions and certificate
//! verification shared by the client and the server.
//!
//! Configurations are built once, up front, and then shared read-only behind
//! an [`Arc`] by every connection that uses them.

use std::{path::Path, sync::Arc};

use rustls::{
    CipherSuite, ClientConfig, CommonState, ConfigBuilder, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
    client::{
        WantsClientCert,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{
        CertificateDer, PrivateKeyDer, ServerName, UnixTime,
        pem::{self, PemObject},
    },
    server::danger::{ClientCertVerified, ClientCertVerifier},
    version::{TLS12, TLS13},
};

use crate::client::tofu::{TofuStore, TofuVerifier};

/// TLS 1.3 and TLS 1.2; nothing older is negotiated.
pub static DEFAULT_PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

/// AEAD suites only. For TLS 1.2 that means ECDHE with RSA or ECDSA
/// authentication and AES-GCM or ChaCha20-Poly1305.
pub fn default_cipher_suites() -> Vec<SupportedCipherSuite> {
    use aws_lc_rs::cipher_suite::*;

    vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// The aws-lc-rs provider limited to [`default_cipher_suites`].
pub fn default_provider() -> CryptoProvider {
    let mut provider = aws_lc_rs::default_provider();
    provider.cipher_suites = default_cipher_suites();
    provider
}

/// How a client decides whether to trust a server certificate.
#[derive(Debug)]
pub enum ServerVerification {
    /// Require a chain to one of the webpki roots.
    WebPki,
    /// Trust on first use, remembering fingerprints in the given store.
    Tofu(TofuStore),
    /// Accept any certificate. Handshake signatures are still checked.
    Insecure,
}

fn client_builder(verification: ServerVerification) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, rustls::Error> {
    let provider = Arc::new(default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = ClientConfig::builder_with_provider(provider).with_protocol_versions(DEFAULT_PROTOCOL_VERSIONS)?;

    let builder = match verification {
        ServerVerification::WebPki => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(root_store)
        }
        ServerVerification::Tofu(store) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TofuVerifier::new(store, algorithms))),
        ServerVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms })),
    };

    Ok(builder)
}

/// A client configuration with the default policy.
pub fn client_config(verification: ServerVerification) -> Result<ClientConfig, rustls::Error> {
    Ok(client_builder(verification)?.with_no_client_auth())
}

/// A client configuration that presents `cert_chain` to servers asking for
/// a client certificate.
pub fn client_config_with_identity(
    verification: ServerVerification,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig, rustls::Error> {
    client_builder(verification)?.with_client_auth_cert(cert_chain, key)
}

/// A server configuration with the default policy.
///
/// Clients may present a certificate; any certificate is accepted, so
/// handlers can make their own decisions with the 6x status codes.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, rustls::Error> {
    let provider = Arc::new(default_provider());
    let algorithms = provider.signature_verification_algorithms;

    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(DEFAULT_PROTOCOL_VERSIONS)?
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert { algorithms }))
        .with_single_cert(cert_chain, key)
}

/// Read every certificate in a PEM file, leaf first.
pub fn load_certificates(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, pem::Error> {
    CertificateDer::pem_file_iter(path)?.collect()
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, pem::Error> {
    PrivateKeyDer::from_pem_file(path)
}

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocolVersion {
    /// TLS 1.3.
    Tls1_3,
    /// TLS 1.2.
    Tls1_2,
    /// An unknown TLS protocol version.
    Unknown,
}

/// The negotiated parameters of an established TLS session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The protocol version.
    pub protocol_version: TlsProtocolVersion,
    /// The cipher suite.
    pub cipher_suite: Option<CipherSuite>,
    /// The certificate chain the peer presented, leaf first. Empty when the
    /// peer sent none.
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// The SNI name the client asked for (server side) or used (client side).
    pub server_name: Option<String>,
}

impl SessionInfo {
    pub(crate) fn capture(state: &CommonState, server_name: Option<String>) -> Self {
        let protocol_version = match state.protocol_version() {
            Some(rustls::ProtocolVersion::TLSv1_3) => TlsProtocolVersion::Tls1_3,
            Some(rustls::ProtocolVersion::TLSv1_2) => TlsProtocolVersion::Tls1_2,
            _ => TlsProtocolVersion::Unknown,
        };

        Self {
            protocol_version,
            cipher_suite: state.negotiated_cipher_suite().map(|suite| suite.suite()),
            peer_certificates: state.peer_certificates().map(<[_]>::to_vec).unwrap_or_default(),
            server_name,
        }
    }
}

/// Accepts any server certificate; used for explicitly insecure clients.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Offers, but does not require, client authentication and accepts any
/// client certificate. Self-signed client certificates are the norm.
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
