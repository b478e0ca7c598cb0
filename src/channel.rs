use crate::{
    call::Call,
    completion_queue::CompletionQueue,
    connection::{Connection, ConnectionConfig},
    socket::{ChannelCredentials, Socket},
    types::TransportError,
};
use log::{debug, warn};
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct ChannelState {
    conn: Option<Arc<Connection>>,
    /// Dialing failed once; calls stay UNAVAILABLE until the channel dies.
    broken: bool,
}

/// Client-side handle for one `host:port` target. Creation does no I/O; the
/// first call dials, runs the TLS handshake when credentials are set, and
/// performs the preface and SETTINGS exchange.
pub struct Channel {
    target: String,
    credentials: Option<ChannelCredentials>,
    config: ConnectionConfig,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Plaintext channel.
    #[must_use]
    pub fn insecure(target: impl Into<String>) -> Self {
        Self::new(target, None, ConnectionConfig::default())
    }

    /// TLS channel; ALPN `h2` and hostname verification come with the
    /// credentials.
    #[must_use]
    pub fn secure(target: impl Into<String>, credentials: ChannelCredentials) -> Self {
        Self::new(target, Some(credentials), ConnectionConfig::default())
    }

    #[must_use]
    pub fn new(
        target: impl Into<String>,
        credentials: Option<ChannelCredentials>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            target: target.into(),
            credentials,
            config,
            state: Mutex::new(ChannelState::default()),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Create a call for `method` (`/service/Method`). The connection is
    /// materialized lazily here; on failure the call still exists and every
    /// batch on it completes with status UNAVAILABLE.
    #[must_use]
    pub fn create_call(
        &self,
        method: impl Into<String>,
        host: Option<String>,
        deadline: Option<Instant>,
        cq: &CompletionQueue,
    ) -> Call {
        let conn = self.ensure_connected();
        let scheme = if self.credentials.is_some() {
            "https"
        } else {
            "http"
        };
        let authority = host.or_else(|| Some(self.target.clone()));
        Call::client(conn, scheme, method, authority, deadline, cq)
    }

    fn ensure_connected(&self) -> Option<Arc<Connection>> {
        let mut state = self.state.lock().expect("channel lock");
        if let Some(conn) = &state.conn {
            if !conn.is_closed() && !conn.is_draining() {
                return Some(conn.clone());
            }
        }
        if state.broken {
            return None;
        }
        match self.dial() {
            Ok(conn) => {
                debug!("channel connected to {}", self.target);
                state.conn = Some(conn.clone());
                Some(conn)
            }
            Err(err) => {
                warn!("channel to {} failed to connect: {}", self.target, err);
                state.broken = true;
                None
            }
        }
    }

    fn dial(&self) -> Result<Arc<Connection>, TransportError> {
        let addr = self
            .target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("target {:?} did not resolve", self.target),
                )
            })?;
        let sock = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        let socket = match &self.credentials {
            None => Socket::plain(sock)?,
            Some(credentials) => {
                let host = self
                    .target
                    .rsplit_once(':')
                    .map_or(self.target.as_str(), |(host, _)| host);
                Socket::client_tls(sock, credentials, host)?
            }
        };
        Connection::connect(socket, self.config)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let state = self.state.lock().expect("channel lock");
        if let Some(conn) = &state.conn {
            // Outstanding streams fail UNAVAILABLE as part of the close.
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{call::Op, metadata::Metadata, types::StatusCode};

    #[test]
    fn creation_does_no_io() {
        // A nonsense target only fails once a call forces the dial.
        let channel = Channel::insecure("definitely-not-a-host:1");
        assert_eq!(channel.target(), "definitely-not-a-host:1");
    }

    #[test]
    fn calls_on_an_unreachable_target_complete_unavailable() {
        let cq = CompletionQueue::new();
        // Port 1 on localhost is refused immediately.
        let channel = Channel::insecure("127.0.0.1:1");
        let call = channel.create_call("/echo.Echo/SayHello", None, None, &cq);
        assert_eq!(
            call.start_batch(
                vec![
                    Op::SendInitialMetadata(Metadata::new()),
                    Op::RecvStatusOnClient,
                ],
                7,
            ),
            crate::types::CallError::Ok
        );
        let event = cq.next(Instant::now() + Duration::from_secs(5));
        assert_eq!(event.tag, 7);
        assert!(!event.success);
        assert_eq!(call.status().unwrap().code, StatusCode::Unavailable);

        // The channel stays broken: the next call fails the same way.
        let second = channel.create_call("/echo.Echo/SayHello", None, None, &cq);
        second.start_batch(vec![Op::RecvStatusOnClient], 8);
        assert!(!cq.next(Instant::now() + Duration::from_secs(5)).success);
    }
}
