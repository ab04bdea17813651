//! Websocket transport: the minimal connection contract the client consumes.
//!
//! Only text frames are supported; a binary frame surfaces as
//! [`TransportError::UnsupportedBinaryMessage`]. Every read and write applies
//! a fresh deadline from the transport configuration.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::errors::TransportError;

/// Interval between pings sent to the server.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

/// Time to wait for the handshake to complete.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline applied to each frame read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline applied to each frame write.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Write buffer size for the websocket connection.
pub const BUFFER_SIZE: usize = 1024 * 32;

const AGENT: &str = "socketio-client (rust; +https://crates.io/crates/socketio-client)";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket transport configuration.
#[derive(Debug, Clone)]
pub struct Transport {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub read_timeout: Duration,
    pub send_timeout: Duration,
    pub buffer_size: usize,
    /// Extra headers sent with the upgrade request.
    pub request_headers: HeaderMap,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// A transport with the default timings and an identifying `User-Agent`.
    pub fn new() -> Self {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(USER_AGENT, HeaderValue::from_static(AGENT));

        Self {
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            buffer_size: BUFFER_SIZE,
            request_headers,
        }
    }

    /// Open a websocket connection to `url`.
    pub async fn connect(&self, url: Url) -> Result<Connection, TransportError> {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().extend(self.request_headers.clone());

        let mut config = WebSocketConfig::default();
        config.write_buffer_size = self.buffer_size;

        let (stream, _) = connect_async_with_config(request, Some(config), false).await?;
        let (sink, stream) = stream.split();

        Ok(Connection {
            read: ConnectionReader {
                stream,
                read_timeout: self.read_timeout,
            },
            write: ConnectionWriter {
                sink,
                send_timeout: self.send_timeout,
            },
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
        })
    }
}

/// An established websocket connection.
pub struct Connection {
    read: ConnectionReader,
    write: ConnectionWriter,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl Connection {
    /// Read the next text frame.
    pub async fn get_message(&mut self) -> Result<String, TransportError> {
        self.read.get_message().await
    }

    /// Write one text frame.
    pub async fn write_message(&mut self, message: &str) -> Result<(), TransportError> {
        self.write.write_message(message).await
    }

    /// Close the connection.
    pub async fn close(&mut self) {
        let _ = self.write.close().await;
    }

    /// The ping interval and timeout configured on the transport.
    pub fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }

    pub(crate) fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.read, self.write)
    }
}

pub(crate) struct ConnectionReader {
    stream: SplitStream<WsStream>,
    read_timeout: Duration,
}

impl ConnectionReader {
    pub(crate) async fn get_message(&mut self) -> Result<String, TransportError> {
        loop {
            let frame = tokio::time::timeout(self.read_timeout, self.stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?
                .ok_or(TransportError::Closed)?;

            match frame {
                Ok(Message::Text(text)) => {
                    if text.is_empty() {
                        return Err(TransportError::PacketType);
                    }
                    return Ok(text);
                }
                Ok(Message::Binary(_)) => return Err(TransportError::UnsupportedBinaryMessage),
                Ok(Message::Close(_)) => return Err(TransportError::Closed),
                // Websocket-level control frames, answered by the protocol
                // layer.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::Utf8) => return Err(TransportError::BadBuffer),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub(crate) struct ConnectionWriter {
    sink: SplitSink<WsStream, Message>,
    send_timeout: Duration,
}

impl ConnectionWriter {
    pub(crate) async fn write_message(&mut self, message: &str) -> Result<(), TransportError> {
        tokio::time::timeout(self.send_timeout, self.sink.send(Message::text(message)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    pub(crate) async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(TransportError::from)
    }
}
