//! rustls client configuration shared by direct TLS and STARTTLS.

use std::sync::{Arc, Once, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Set once at startup from `--dangerous-insecure-tls`.
static DANGEROUS_INSECURE_TLS: OnceLock<bool> = OnceLock::new();

/// Disable certificate verification for every later TLS handshake in the process.
pub fn set_dangerous_insecure_tls(enabled: bool) {
    let _ = DANGEROUS_INSECURE_TLS.set(enabled);
}

fn is_insecure_tls() -> bool {
    DANGEROUS_INSECURE_TLS.get().copied().unwrap_or(false)
}

/// Install the ring crypto provider as the process default.
pub fn init_crypto_provider() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any server certificate. Only used with `--dangerous-insecure-tls`.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn client_config() -> Result<ClientConfig> {
    if is_insecure_tls() {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        return Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(provider)))
            .with_no_client_auth());
    }

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(error = %e, "Failed to load a system certificate");
    }
    if native.certs.is_empty() {
        return Err(Error::Tls(
            "no system root certificates found (is ca-certificates installed?)".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(added, ignored, "Some system root certificates could not be parsed");
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

pub fn create_tls_connector() -> Result<TlsConnector> {
    init_crypto_provider();
    Ok(TlsConnector::from(Arc::new(client_config()?)))
}

fn classify(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// Run a TLS client handshake over `stream`, using `host` for SNI and verification.
pub async fn upgrade<S>(stream: S, host: &str) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = create_tls_connector()?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", host, e)))?;

    connector.connect(server_name, stream).await.map_err(|e| {
        let detail = e.to_string();
        let class = classify(&detail);
        error!(host, error = %e, error_class = class, "TLS handshake failed");
        Error::Tls(format!("handshake with {} failed ({}): {}", host, class, detail))
    })
}
