//! Reliable streams over the shared udp port.
//!
//! Each udp [`PeerSocket`](crate::PeerSocket) is one bidirectional QUIC
//! stream. The dialer writes a one byte preamble so the acceptor sees the
//! stream as soon as it is opened.

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{
    ClientConfig, Connection, Endpoint, EndpointConfig, Incoming, RecvStream, SendStream,
    ServerConfig, TokioRuntime, TransportConfig,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::{Error, ErrorKind::Other, Result};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const SERVER_NAME: &str = "localhost";
const PREAMBLE: [u8; 1] = [0];
const KEEP_ALIVE: Duration = Duration::from_secs(5);

fn other<E>(e: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::new(Other, e)
}

/// Run a QUIC endpoint, accepting and dialing, on an already bound socket.
pub(crate) fn endpoint(socket: UdpSocket) -> Result<Endpoint> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).map_err(other)?;
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(other)?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key.into())
        .map_err(other)?;

    let client = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(other)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();

    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    let transport = Arc::new(transport);

    let mut server_config =
        ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(server).map_err(other)?));
    server_config.transport_config(transport.clone());

    let mut client_config =
        ClientConfig::new(Arc::new(QuicClientConfig::try_from(client).map_err(other)?));
    client_config.transport_config(transport);

    socket.set_nonblocking(true)?;
    let mut endpoint = Endpoint::new(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(TokioRuntime),
    )?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

pub(crate) async fn dial(
    endpoint: &Endpoint,
    addr: SocketAddr,
) -> Result<(Connection, SendStream, RecvStream)> {
    let conn = endpoint
        .connect(addr, SERVER_NAME)
        .map_err(other)?
        .await
        .map_err(other)?;

    let (mut send, recv) = conn.open_bi().await.map_err(other)?;
    send.write_all(&PREAMBLE).await.map_err(other)?;

    Ok((conn, send, recv))
}

pub(crate) async fn accept(incoming: Incoming) -> Result<(Connection, SendStream, RecvStream)> {
    let conn = incoming.await.map_err(other)?;
    let (send, mut recv) = conn.accept_bi().await.map_err(other)?;

    let mut preamble = [0u8; 1];
    recv.read_exact(&mut preamble).await.map_err(other)?;
    if preamble != PREAMBLE {
        return Err(Error::new(Other, "invalid stream preamble"));
    }

    Ok((conn, send, recv))
}

/// Peers are not identified by certificates, only the handshake
/// signature is checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
