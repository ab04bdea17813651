//! Socket.IO v3 client over an engine.io v3 websocket transport.
//!
//! The client connects to a socket.io server, subscribes to named events
//! within namespaces, publishes events back, and issues request/reply calls
//! correlated by ack id. Only text frames are supported; binary attachments,
//! transport upgrades and reconnection are out of scope.
//!
//! # Example
//!
//! ```no_run
//! use socketio_client::{Client, Transport};
//! use url::Url;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let url = Url::parse("ws://localhost:3000")?;
//!     let client = Client::connect(url, Transport::new()).await?;
//!
//!     client.on("stdout", |line: String| println!("{line}"));
//!     client.emit("stdin", "ls").await?;
//!
//!     let booking: serde_json::Value = client.ack("book_hotel", "JFK").await?;
//!     println!("booked: {booking}");
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! Handlers take any number of [`serde::Deserialize`] parameters and run on
//! the ingress task in frame order; long-running work should be moved off
//! the callback. A handler registered with
//! [`on_with_ack`](Client::on_with_ack) returns a [`serde::Serialize`] value
//! that automatically answers incoming ack requests.

mod ack;
mod client;
mod errors;
mod handler;
mod ns;
mod packet;
mod transport;

pub use client::Client;
pub use errors::{AckError, DecodeError, DispatchError, EncodeError, Error, TransportError};
pub use handler::{MessageHandler, ReplyHandler};
pub use ns::Namespace;
pub use packet::OpenHeader;
pub use transport::{Connection, Transport};

/// Event fired on a namespace when the server acknowledges it.
pub const ON_CONNECTION: &str = "connection";

/// Event fired on the default namespace when the client is closed.
pub const ON_DISCONNECT: &str = "disconnect";

/// Event fired when the client encounters a protocol or transport error;
/// register its listener with [`Client::on_error`].
pub const ON_ERROR: &str = "error";
