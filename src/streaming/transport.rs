//! WebSocket transport for the realtime session
//!
//! The connection manager never touches a socket type directly: it asks a
//! [`Connector`] for a [`Socket`], writes frames through its [`FrameSink`]
//! and reads [`SocketSignal`]s from its [`FrameStream`]. [`WsConnector`] is
//! the production implementation on top of `tokio-tungstenite`; tests inject
//! an in-memory connector.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        protocol::CloseFrame,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::StreamingError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Something the socket reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSignal {
    /// A text frame
    Text(String),
    /// Transport error; a `Closed` signal (or end of stream) follows
    Error(String),
    /// The socket closed
    Closed { was_clean: bool, reason: String },
}

/// Inbound half of a socket
pub type FrameStream = BoxStream<'static, SocketSignal>;

/// Outbound half of a socket
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame
    async fn send_text(&mut self, text: String) -> Result<(), StreamingError>;

    /// Close the socket gracefully
    async fn close(&mut self);
}

/// An open socket
pub struct Socket {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

/// Socket factory
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<Socket, StreamingError>;
}

/// `tokio-tungstenite` connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
        }
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Socket, StreamingError> {
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::InvalidUrl(e.to_string()))?;

        log::info!(
            "Connecting to realtime endpoint {}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or("?"),
            url.path()
        );

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::Timeout(self.connect_timeout.as_millis() as u64))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected");

        let (write, read) = ws_stream.split();

        let stream = read
            .filter_map(|msg_result| async move {
                match msg_result {
                    Ok(Message::Text(text)) => Some(SocketSignal::Text(text)),
                    Ok(Message::Close(frame)) => Some(close_signal(frame)),
                    Err(e) => Some(SocketSignal::Error(e.to_string())),
                    _ => None, // Ignore ping/pong/binary
                }
            })
            .boxed();

        Ok(Socket {
            sink: Box::new(WsSink { write }),
            stream,
        })
    }
}

/// A received close frame means the close handshake completed, whatever the
/// code. Only a dropped stream or transport error counts as unclean.
fn close_signal(frame: Option<CloseFrame<'_>>) -> SocketSignal {
    match frame {
        Some(frame) => SocketSignal::Closed {
            was_clean: true,
            reason: format!("{} {}", u16::from(frame.code), frame.reason),
        },
        None => SocketSignal::Closed {
            was_clean: true,
            reason: "closed without status".to_string(),
        },
    }
}

struct WsSink {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), StreamingError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            log::warn!("Error closing WebSocket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_close_signal_normal_is_clean() {
        let signal = close_signal(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        assert_eq!(
            signal,
            SocketSignal::Closed {
                was_clean: true,
                reason: "1000 bye".to_string()
            }
        );
    }

    #[test]
    fn test_close_signal_any_code_is_clean() {
        for code in [CloseCode::Away, CloseCode::Error] {
            let signal = close_signal(Some(CloseFrame {
                code,
                reason: "".into(),
            }));
            assert!(matches!(signal, SocketSignal::Closed { was_clean: true, .. }));
        }

        let signal = close_signal(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        }));
        assert_eq!(
            signal,
            SocketSignal::Closed {
                was_clean: true,
                reason: "1001 restarting".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let connector = WsConnector::new(Duration::from_millis(500));
        let url = Url::parse("ws://127.0.0.1:1/realtime").unwrap();

        let result = connector.open(&url).await;
        assert!(result.is_err());
    }
}
