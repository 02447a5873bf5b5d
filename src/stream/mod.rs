pub mod protocol;

use futures::StreamExt;
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// WebSocket subscription to the uplink feed
///
/// The socket is owned here and released on [`close`](Self::close), on any
/// read error, or when the connection is dropped. There is no automatic
/// reconnection: after `Closed`, only an explicit [`open`](Self::open)
/// subscribes again.
pub struct StreamConnection {
    url: String,
    state: ConnectionState,
    socket: Option<Socket>,
}

impl StreamConnection {
    /// Create a connection (does not connect yet)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: ConnectionState::Disconnected,
            socket: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and start dispatching frames.
    ///
    /// An already open connection is closed first, so this also serves as a
    /// fresh subscription after a filter change.
    pub async fn open(&mut self) -> anyhow::Result<()> {
        if self.socket.is_some() {
            self.close().await;
        }

        self.state = ConnectionState::Connecting;
        info!("Connecting to uplink stream {}...", self.url);

        match connect_async(self.url.as_str()).await {
            Ok((socket, response)) => {
                debug!("Handshake response: {}", response.status());
                self.socket = Some(socket);
                self.state = ConnectionState::Open;
                info!("WebSocket connection opened");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(anyhow::anyhow!("failed to connect to {}: {}", self.url, e))
            }
        }
    }

    /// Next text frame, or `None` once the connection is closed.
    ///
    /// Socket errors are logged and close the connection.
    pub async fn next_frame(&mut self) -> Option<String> {
        let socket = self.socket.as_mut()?;

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(text),
                    Err(e) => warn!("Skipping non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    info!("Uplink stream closed by server: {:?}", frame);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                None => {
                    info!("Uplink stream ended");
                    break;
                }
            }
        }

        self.socket = None;
        self.state = ConnectionState::Closed;
        None
    }

    /// Close the socket (close handshake is best effort)
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            match socket.close(None).await {
                Ok(()) => info!("Uplink stream {} closed", self.url),
                Err(e) => debug!("Close handshake failed (non-critical): {}", e),
            }
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closed;
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            debug!("Dropping open uplink stream {}", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/uplinks", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_dispatches_frames_until_server_closes() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("Received: {}".to_string())).await.unwrap();
            ws.send(Message::Binary(br#"{"FRMPayload":"00"}"#.to_vec()))
                .await
                .unwrap();
            let _ = ws.close(None).await;
        });

        let mut conn = StreamConnection::new(url);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.next_frame().await, None);

        tokio_test::assert_ok!(conn.open().await);
        assert!(conn.is_open());
        assert_eq!(conn.next_frame().await.as_deref(), Some("Received: {}"));
        assert_eq!(conn.next_frame().await.as_deref(), Some(r#"{"FRMPayload":"00"}"#));
        assert_eq!(conn.next_frame().await, None);
        assert_eq!(conn.state(), ConnectionState::Closed);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_closed() {
        let (listener, url) = listener().await;
        drop(listener);

        let mut conn = StreamConnection::new(url);
        tokio_test::assert_err!(conn.open().await);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Client close shows up as a Close message or end of stream
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        });

        let mut conn = StreamConnection::new(url);
        conn.open().await.unwrap();
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.next_frame().await, None);

        server.await.unwrap();
    }
}
