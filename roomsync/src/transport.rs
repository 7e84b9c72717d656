//! Transport seam between the session and the network.
//!
//! A [`Connector`] opens one connection and hands back a [`Transport`]: a
//! sink of outbound text frames and a stream of inbound ones. The session
//! never sees the socket itself. [`WsConnector`] is the production
//! implementation over `tokio-tungstenite`.
//!
//! Stream contract: `Some(Ok(frame))` per text frame, `Some(Err(_))` for a
//! transport error (reported, not fatal by itself), `None` once the
//! connection is closed.

use std::fmt;
use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// Connection state machine.
///
/// ```text
/// Closed ──connect()──► Connecting ──opened──► Open
///    ▲                      │                   │
///    │◄──attempt failed─────┘                   │ close()
///    │◄──────────peer closed / send failed──────┤
///    │                                          ▼
///    └─────────────────────────────────────── Closing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("pre-connect hook failed: {0}")]
    PreConnect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("stream error: {0}")]
    Stream(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens connections to a relay endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, TransportError>> {
        async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(url.to_string())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (ws_writer, ws_reader) = ws_stream.split();

            let sink = ws_writer
                .sink_map_err(|e| TransportError::Send(e.to_string()))
                .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(frame.into()))));

            // After an error the reader is dropped, ending the stream.
            let stream = futures_util::stream::unfold(Some(ws_reader), |reader| async move {
                let mut reader = reader?;
                loop {
                    match reader.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            return Some((Ok(text.as_str().to_owned()), Some(reader)));
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            // Not valid protocol, but let the decoder report it
                            let frame = String::from_utf8_lossy(&data).into_owned();
                            return Some((Ok(frame), Some(reader)));
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return None,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Some((Err(TransportError::Stream(e.to_string())), None));
                        }
                    }
                }
            });

            Ok(Transport::new(sink, stream))
        }
        .boxed()
    }
}
