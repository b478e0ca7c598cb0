use crate::types::TransportError;
use bytes::BytesMut;
use log::trace;
use rustls::{OwnedTrustAnchor, RootCertStore};
use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

const READ_CHUNK: usize = 8 * 1024;
const WRITE_RETRY: Duration = Duration::from_millis(1);

/// Client-side TLS configuration. ALPN offers exactly `h2`; the peer
/// certificate is verified against the webpki roots, hostname included.
#[derive(Clone)]
pub struct ChannelCredentials {
    config: Arc<rustls::ClientConfig>,
}

impl ChannelCredentials {
    #[must_use]
    pub fn tls() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            config: Arc::new(config),
        }
    }

    /// Bring your own config (custom roots, client auth). ALPN is forced to
    /// `h2` regardless.
    #[must_use]
    pub fn with_config(mut config: rustls::ClientConfig) -> Self {
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            config: Arc::new(config),
        }
    }
}

/// Server-side TLS configuration from a PEM certificate chain and key.
#[derive(Clone)]
pub struct ServerCredentials {
    config: Arc<rustls::ServerConfig>,
}

impl ServerCredentials {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])?
            .into_iter()
            .map(rustls::Certificate)
            .collect();
        let key = rustls_pemfile::pkcs8_private_keys(&mut &key_pem[..])?
            .into_iter()
            .next()
            .map(rustls::PrivateKey)
            .ok_or_else(|| {
                TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no private key in PEM input",
                ))
            })?;
        let mut config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

struct TlsSocket {
    session: rustls::Connection,
    sock: TcpStream,
}

/// Byte stream under a connection: plain TCP or TLS. The handshake runs on
/// a blocking socket; afterwards the socket is non-blocking, reads are
/// chunked polls and writes retry on `WouldBlock`.
pub enum Socket {
    Tcp(TcpStream),
    Tls(Box<TlsSocket>),
}

impl Socket {
    pub fn plain(sock: TcpStream) -> Result<Self, TransportError> {
        sock.set_nodelay(true)?;
        sock.set_nonblocking(true)?;
        Ok(Self::Tcp(sock))
    }

    /// Client TLS handshake: verify the peer against `host`, require the
    /// negotiated protocol to be exactly `h2`.
    pub fn client_tls(
        sock: TcpStream,
        credentials: &ChannelCredentials,
        host: &str,
    ) -> Result<Self, TransportError> {
        sock.set_nodelay(true)?;
        let server_name = host
            .try_into()
            .map_err(|_| rustls::Error::General(format!("invalid server name {:?}", host)))?;
        let session =
            rustls::ClientConnection::new(credentials.config.clone(), server_name)?.into();
        Self::handshake(session, sock)
    }

    pub fn server_tls(
        sock: TcpStream,
        credentials: &ServerCredentials,
    ) -> Result<Self, TransportError> {
        sock.set_nodelay(true)?;
        let session = rustls::ServerConnection::new(credentials.config.clone())?.into();
        Self::handshake(session, sock)
    }

    fn handshake(
        mut session: rustls::Connection,
        mut sock: TcpStream,
    ) -> Result<Self, TransportError> {
        while session.is_handshaking() {
            if session.wants_write() {
                session.write_tls(&mut sock)?;
            } else if session.wants_read() {
                if session.read_tls(&mut sock)? == 0 {
                    return Err(TransportError::ShortRead);
                }
                session.process_new_packets()?;
            }
        }
        match session.alpn_protocol() {
            Some(b"h2") => {}
            other => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("ALPN did not select h2: {:?}", other),
                )))
            }
        }
        trace!("TLS handshake complete");
        sock.set_nonblocking(true)?;
        Ok(Self::Tls(Box::new(TlsSocket { session, sock })))
    }

    /// Pull whatever bytes are ready into `buf`. `Ok(None)` means nothing
    /// was ready; `Ok(Some(0))` is EOF.
    pub fn read_available(&mut self, buf: &mut BytesMut) -> Result<Option<usize>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        match self {
            Self::Tcp(sock) => match sock.read(&mut chunk) {
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    Ok(Some(n))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
                Err(err) => Err(err.into()),
            },
            Self::Tls(tls) => loop {
                match tls.session.reader().read(&mut chunk) {
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        return Ok(Some(n));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // No plaintext buffered; try to pull TLS records.
                        match tls.session.read_tls(&mut tls.sock) {
                            Ok(0) => return Ok(Some(0)),
                            Ok(_) => {
                                tls.session.process_new_packets()?;
                            }
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(None)
                            }
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                                return Ok(None)
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            },
        }
    }

    /// Write the whole buffer, retrying on `WouldBlock`. Held under the
    /// connection write lock, so one frame stays atomic on the wire.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::Tcp(sock) => {
                while !data.is_empty() {
                    match sock.write(data) {
                        Ok(0) => return Err(TransportError::ShortRead),
                        Ok(n) => data = &data[n..],
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(WRITE_RETRY);
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
            Self::Tls(tls) => {
                // Plaintext goes into the session buffer whole; only the
                // TLS records can hit WouldBlock.
                tls.session.writer().write_all(data)?;
                while tls.session.wants_write() {
                    match tls.session.write_tls(&mut tls.sock) {
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(WRITE_RETRY);
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
        }
    }

    /// Close both directions. TLS sends close_notify first, best effort.
    pub fn shutdown(&mut self) {
        match self {
            Self::Tcp(sock) => {
                sock.shutdown(std::net::Shutdown::Both).ok();
            }
            Self::Tls(tls) => {
                tls.session.send_close_notify();
                while tls.session.wants_write() {
                    if tls.session.write_tls(&mut tls.sock).is_err() {
                        break;
                    }
                }
                tls.sock.shutdown(std::net::Shutdown::Both).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::plain(client).unwrap(), server)
    }

    #[test]
    fn read_available_returns_none_when_idle() {
        let (mut socket, _peer) = pair();
        let mut buf = BytesMut::new();
        assert!(matches!(socket.read_available(&mut buf), Ok(None)));
        assert!(buf.is_empty());
    }

    #[test]
    fn read_available_sees_peer_bytes() {
        let (mut socket, mut peer) = pair();
        peer.write_all(b"ping").unwrap();
        let mut buf = BytesMut::new();
        // The bytes may take a moment to land.
        for _ in 0..100 {
            if socket.read_available(&mut buf).unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buf.as_ref(), b"ping");
    }

    #[test]
    fn read_available_reports_eof() {
        let (mut socket, peer) = pair();
        drop(peer);
        let mut buf = BytesMut::new();
        for _ in 0..100 {
            match socket.read_available(&mut buf).unwrap() {
                Some(0) => return,
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
        panic!("EOF never observed");
    }

    #[test]
    fn write_all_round_trips() {
        let (mut socket, mut peer) = pair();
        socket.write_all(b"hello peer").unwrap();
        let mut read = [0u8; 10];
        peer.read_exact(&mut read).unwrap();
        assert_eq!(&read, b"hello peer");
    }
}
