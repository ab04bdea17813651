use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Error type for the client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// An error frame delivered by the server, fired on the `error` event of
    /// the namespace it belongs to.
    #[error("error on method {event:?} on namespace {nsp:?}")]
    Protocol { event: String, nsp: String },

    #[error("invalid open packet payload: {0}")]
    OpenPayload(#[source] serde_json::Error),

    #[error("socket.io connection timeout ({0:?})")]
    ConnectTimeout(Duration),

    /// The client was closed and its write loop is gone.
    #[error("connection closed")]
    Closed,
}

/// Error type for the websocket transport.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("receiving binary messages is not supported")]
    UnsupportedBinaryMessage,

    #[error("error while reading buffer")]
    BadBuffer,

    #[error("wrong packet type")]
    PacketType,

    #[error("transport deadline exceeded")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("ws transport error: {0}")]
    Ws(#[from] Box<tungstenite::Error>),
}

impl TransportError {
    /// Content-level errors: the frame is dropped but the connection is kept.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::UnsupportedBinaryMessage
                | TransportError::BadBuffer
                | TransportError::PacketType
        )
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        TransportError::Ws(Box::new(err))
    }
}

/// Error type for packet decoding.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("wrong message type")]
    WrongMessageType,

    #[error("wrong packet")]
    WrongPacket,

    #[error("can't decode message type {0:?}")]
    UnknownType(char),

    #[error("invalid ack id: {0}")]
    InvalidAckId(#[from] std::num::ParseIntError),
}

/// Error type for packet encoding.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("wrong message type")]
    WrongMessageType,

    #[error("error serializing arguments: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error type for routing a decoded packet into a registered handler.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// The payload shape does not fit the handler signature.
    #[error("invalid interface for handling request for {event:?} call: {reason}")]
    InvalidInterface { event: String, reason: String },

    #[error("error decoding event arguments: {0}")]
    Json(serde_json::Error),
}

/// Error type for ack (request/reply) operations.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The ack response could not be deserialized into the expected type.
    #[error("cannot deserialize ack response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The ack request could not be sent.
    #[error("error sending ack request: {0}")]
    Send(#[source] Box<Error>),

    /// The client was closed before the reply arrived.
    #[error("connection closed before the ack reply arrived")]
    Closed,
}
