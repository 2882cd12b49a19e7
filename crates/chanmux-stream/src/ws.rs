//! WebSocket transport.
//!
//! Uses the blocking `tungstenite` client re-exported by `tokio-tungstenite`
//! (native TLS). The TCP connect is bounded by the connect timeout, and the
//! TLS and WebSocket handshakes run on that stream with the same bound on
//! each read and write. Afterwards the read timeout is set on the underlying
//! `TcpStream`, so a read returns `WouldBlock`/`TimedOut` instead of hanging,
//! which keeps the receiver responsive to `stop()`.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tokio_tungstenite::tungstenite::{
    self, Error as WsError, HandshakeError, Message, WebSocket, client::IntoClientRequest,
    stream::MaybeTlsStream,
};
use tracing::{debug, info};

use crate::transport::{Connector, Socket, TransportError};

/// Connects to a fixed WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self, connect_timeout: Duration, read_timeout: Duration) -> Result<Box<dyn Socket>, TransportError> {
        info!("[ws] connecting to {}", self.url);
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("bad url {}: {e}", self.url)))?;
        let addrs = resolve(request.uri())?;

        let tcp = connect_any(&addrs, connect_timeout)?;
        tcp.set_read_timeout(Some(connect_timeout)).map_err(io_error)?;
        tcp.set_write_timeout(Some(connect_timeout)).map_err(io_error)?;

        let (mut socket, response) = tungstenite::client_tls(request, tcp).map_err(|e| match e {
            HandshakeError::Interrupted(_) => TransportError::Connect(format!("handshake timed out after {connect_timeout:?}")),
            HandshakeError::Failure(e) => TransportError::Connect(e.to_string()),
        })?;
        debug!("[ws] handshake status {}", response.status());

        let tcp = tcp_of(socket.get_mut())?;
        tcp.set_read_timeout(Some(read_timeout)).map_err(io_error)?;
        tcp.set_nodelay(true).map_err(io_error)?;
        info!("[ws] connected");
        Ok(Box::new(WsSocket { inner: socket }))
    }
}

/// Resolve the host of a `ws://` or `wss://` URI, defaulting the port by
/// scheme.
fn resolve(uri: &tungstenite::http::Uri) -> Result<Vec<SocketAddr>, TransportError> {
    let host = uri
        .host()
        .ok_or_else(|| TransportError::Connect(format!("no host in {uri}")))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(format!("resolve {host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Connect(format!("{host} resolved to no address")));
    }
    Ok(addrs)
}

/// Try each address in turn, each bounded by `timeout`.
fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream, TransportError> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                debug!("[ws] connect {addr} failed: {e}");
                last = Some(e);
            }
        }
    }
    let reason = last.map(|e| e.to_string()).unwrap_or_default();
    Err(TransportError::Connect(reason))
}

fn tcp_of(stream: &mut MaybeTlsStream<TcpStream>) -> Result<&mut TcpStream, TransportError> {
    match stream {
        MaybeTlsStream::Plain(s) => Ok(s),
        MaybeTlsStream::NativeTls(s) => Ok(s.get_mut()),
        _ => Err(TransportError::Connect("unsupported TLS backend".into())),
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

struct WsSocket {
    inner: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl Socket for WsSocket {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.inner.send(Message::text(text.to_owned())).map_err(map_ws_error)
    }

    fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        match self.inner.read() {
            Ok(Message::Text(text)) => Ok(Some(text.as_str().to_owned())),
            Ok(Message::Close(frame)) => {
                debug!("[ws] close frame: {frame:?}");
                Err(TransportError::Closed)
            }
            // Ping is answered by tungstenite on the next read/write.
            Ok(_) => Ok(None),
            Err(WsError::Io(io)) if is_timeout(&io) => Ok(None),
            Err(e) => Err(map_ws_error(e)),
        }
    }

    fn close(&mut self) {
        let _ = self.inner.close(None);
        let _ = self.inner.flush();
    }
}

fn is_timeout(io: &std::io::Error) -> bool {
    matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn map_ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ) =>
        {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}
