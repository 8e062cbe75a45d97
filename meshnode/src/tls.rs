use std::{sync::Arc, time::Duration};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        verify_server_cert_signed_by_trust_anchor,
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::{ParsedCertificate, WebPkiClientVerifier},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::{
    certs::{self, CertificateStore, TrustStore},
    error::{Error, ErrorKind, Result},
    identity::{ConnectionDirection, NodeIdentity, PeerInfo, PeerType},
};

fn handshake_error(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::TlsHandshakeFailed, e.to_string())
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Chain validation against `roots`, without any host name check.
fn chain_is_trusted(
    provider: &CryptoProvider,
    roots: &RootCertStore,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    now: UnixTime,
) -> std::result::Result<(), rustls::Error> {
    let cert = ParsedCertificate::try_from(end_entity)?;
    verify_server_cert_signed_by_trust_anchor(
        &cert,
        roots,
        intermediates,
        now,
        provider.signature_verification_algorithms.all,
    )
}

/// Verifies the certificate of an outbound peer.
///
/// Nodes are addressed by IP or arbitrary host names, so the chain is
/// checked against the trust store but the name is not. A pinned
/// fingerprint must match the leaf certificate; a matching pin is accepted
/// even without a trusted chain.
#[derive(Debug)]
struct PeerCertVerifier {
    roots: Arc<RootCertStore>,
    pinned: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(pinned) = &self.pinned {
            if certs::fingerprint(end_entity) != *pinned {
                return Err(rustls::Error::General(
                    "peer certificate fingerprint mismatch".to_string(),
                ));
            }
            return Ok(ServerCertVerified::assertion());
        }
        chain_is_trusted(&self.provider, &self.roots, end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds TLS configurations from the node's certificate and trust store and
/// turns finished handshakes into classified peers.
#[derive(Debug, Clone)]
pub struct TlsContext {
    certs: CertificateStore,
    trust: TrustStore,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
    certificate_grace: Duration,
}

impl TlsContext {
    #[must_use]
    pub fn new(certs: CertificateStore, trust: TrustStore) -> Self {
        Self {
            certs,
            trust,
            provider: crypto_provider(),
            handshake_timeout: Duration::from_secs(10),
            certificate_grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_timeouts(
        mut self,
        handshake_timeout: Duration,
        certificate_grace: Duration,
    ) -> Self {
        self.handshake_timeout = handshake_timeout;
        self.certificate_grace = certificate_grace;
        self
    }

    #[must_use]
    pub fn certificates(&self) -> &CertificateStore {
        &self.certs
    }

    #[must_use]
    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    fn own_certificate(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        self.certs.ensure_certificate()?;
        if self.certs.is_self_signed()? {
            return Err(Error::new(
                ErrorKind::Configuration,
                "cannot use a self-signed certificate, a CA-signed one is required",
            ));
        }
        Ok((self.certs.certificate_chain()?, self.certs.private_key()?))
    }

    fn roots(&self) -> Result<Arc<RootCertStore>> {
        let roots = self.trust.root_store()?;
        if roots.is_empty() {
            return Err(Error::new(
                ErrorKind::Configuration,
                "the trust store holds no CA certificate",
            ));
        }
        Ok(Arc::new(roots))
    }

    /// Requests client certificates and validates presented ones against
    /// the trust store. Connections without one are not refused by TLS.
    ///
    /// # Errors
    ///
    /// `Configuration` for a self-signed certificate or an empty trust store.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let (chain, key) = self.own_certificate()?;
        let verifier =
            WebPkiClientVerifier::builder_with_provider(self.roots()?, self.provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::new(ErrorKind::Configuration, e.to_string()))?;
        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// # Errors
    ///
    /// `Configuration` for a self-signed certificate or an empty trust store.
    pub fn client_config(&self, fingerprint: Option<&str>) -> Result<Arc<ClientConfig>> {
        let (chain, key) = self.own_certificate()?;
        let verifier = PeerCertVerifier {
            roots: self.roots()?,
            pinned: fingerprint.map(certs::normalize_fingerprint),
            provider: self.provider.clone(),
        };
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// Whether the trust store vouches for `chain` (leaf first).
    #[must_use]
    pub fn is_trusted(&self, chain: &[CertificateDer<'_>]) -> bool {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return false;
        };
        let Ok(roots) = self.trust.root_store() else {
            return false;
        };
        chain_is_trusted(&self.provider, &roots, leaf, intermediates, UnixTime::now()).is_ok()
    }

    /// Classifies the remote end of a finished handshake.
    ///
    /// # Errors
    ///
    /// `PeerCertificateMissing` if the peer presented no certificate.
    pub fn identify(
        &self,
        address: &str,
        direction: ConnectionDirection,
        chain: &[CertificateDer<'_>],
    ) -> Result<PeerInfo> {
        let Some(leaf) = chain.first() else {
            return Err(Error::new(
                ErrorKind::PeerCertificateMissing,
                format!("{address} presented no certificate"),
            ));
        };
        let peer_type = PeerType::classify(direction, self.is_trusted(chain));
        let identity = certs::common_name(leaf)?
            .and_then(|cn| NodeIdentity::from_common_name(&cn).ok());
        let mut peer = PeerInfo::new(address, peer_type, direction);
        peer.identity = identity;
        Ok(peer)
    }

    /// Completes the server side of a handshake.
    ///
    /// A client without certificate is kept for the grace period before the
    /// socket is dropped.
    ///
    /// # Errors
    ///
    /// `TlsHandshakeFailed` or `PeerCertificateMissing`.
    pub async fn accept<IO>(
        &self,
        acceptor: &TlsAcceptor,
        io: IO,
        address: &str,
    ) -> Result<(TlsStream<IO>, PeerInfo)>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = tokio::time::timeout(self.handshake_timeout, acceptor.accept(io))
            .await
            .map_err(|_| handshake_error(format!("handshake with {address} timed out")))?
            .map_err(handshake_error)?;
        let chain: Vec<CertificateDer<'static>> = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default();

        match self.identify(address, ConnectionDirection::Incoming, &chain) {
            Ok(peer) => Ok((TlsStream::from(stream), peer)),
            Err(e) => {
                if e.kind == ErrorKind::PeerCertificateMissing {
                    tracing::warn!(
                        "{e}, closing the connection in {:?}",
                        self.certificate_grace
                    );
                    tokio::time::sleep(self.certificate_grace).await;
                }
                drop(stream);
                Err(e)
            }
        }
    }

    /// Completes the client side of a handshake with `address`.
    ///
    /// # Errors
    ///
    /// `TlsHandshakeFailed` or `PeerCertificateMissing`.
    pub async fn connect<IO>(
        &self,
        config: Arc<ClientConfig>,
        io: IO,
        address: &str,
    ) -> Result<(TlsStream<IO>, PeerInfo)>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = server_name(address)?;
        let connector = TlsConnector::from(config);
        let handshake = connector.connect(server_name, io);
        let stream = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| handshake_error(format!("handshake with {address} timed out")))?
            .map_err(handshake_error)?;
        let chain: Vec<CertificateDer<'static>> = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default();
        let peer = self.identify(address, ConnectionDirection::Outgoing, &chain)?;
        Ok((TlsStream::from(stream), peer))
    }
}

/// `host:port`, `tcp://host:port` or `[v6]:port` to a TLS server name.
///
/// # Errors
///
/// `InvalidArgument` for an address without a usable host.
pub fn server_name(address: &str) -> Result<ServerName<'static>> {
    let host_port = address.strip_prefix("tcp://").unwrap_or(address);
    let host = match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => host_port,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::invalid_argument("peerAddress", format!("{address}: {e}")))
}
