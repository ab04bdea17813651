//! Namespace handles: thin views over the client bound to one namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::ack::AckWaiter;
use crate::client::ClientInner;
use crate::errors::{AckError, EncodeError, Error};
use crate::handler::{
    Handler, HandlerKey, MakeErasedHandler, MakeErasedReplyHandler, MessageHandler, ReplyHandler,
    VariadicHandler,
};
use crate::packet::{encode, Packet};
use crate::ON_ERROR;

pub(crate) struct NsState {
    pub(crate) name: String,
    ready: AtomicBool,
}

impl NsState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ready: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// A view of the connection scoped to one namespace.
///
/// Namespaces share the owning client's handler registry, ack waiter and
/// write loop; they live until the client is closed. Obtained from
/// [`Client::of`](crate::Client::of).
#[derive(Clone)]
pub struct Namespace {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) state: Arc<NsState>,
}

impl Namespace {
    pub(crate) fn new(client: Arc<ClientInner>, state: Arc<NsState>) -> Self {
        Self { client, state }
    }

    /// The namespace name, `""` for the default namespace.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether the server has acknowledged this namespace.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Register a listener for `event`, silently replacing any previous one.
    pub fn on<T, H>(&self, event: &str, handler: H)
    where
        H: MessageHandler<T>,
        T: 'static,
    {
        self.set_handler(event, Handler::Event(Box::new(MakeErasedHandler::new(handler))));
    }

    /// Register a listener whose return value answers incoming ack requests
    /// for `event`.
    pub fn on_with_ack<T, H>(&self, event: &str, handler: H)
    where
        H: ReplyHandler<T>,
        T: 'static,
    {
        self.set_handler(
            event,
            Handler::Event(Box::new(MakeErasedReplyHandler::new(handler))),
        );
    }

    /// Register a listener receiving every argument of `event` as a
    /// [`Value`], however many the server sends.
    pub fn on_variadic<F>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.set_handler(event, Handler::Event(Box::new(VariadicHandler(handler))));
    }

    /// Register the listener for the `error` event of this namespace. The
    /// callback receives the error value itself.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.set_handler(ON_ERROR, Handler::Error(Box::new(handler)));
    }

    /// Unregister the listener for `event`.
    pub fn off(&self, event: &str) {
        self.client.handlers.remove(&self.state.name, event);
    }

    /// Events with a listener registered on this namespace.
    pub fn listeners(&self) -> Vec<String> {
        self.client.handlers.list(&self.state.name)
    }

    /// Emit `event` with the given arguments. Arguments serializing to a
    /// JSON array are spread into the socket.io argument list; any other
    /// value becomes the single argument, and `()` emits the event alone.
    pub async fn emit(&self, event: &str, args: impl Serialize) -> Result<(), Error> {
        let args = serde_json::to_value(args).map_err(EncodeError::Json)?;
        self.send(Packet::event(self.state.name.clone(), event), &args)
            .await
    }

    /// Emit `event` requesting an acknowledgement and wait for the reply.
    ///
    /// The registered ack slot is released when the reply arrives, when the
    /// send fails, or when this future is dropped (e.g. by a caller-side
    /// timeout).
    pub async fn ack<T, A>(&self, event: &str, args: A) -> Result<T, AckError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        let ack_id = self.client.ack.next();
        let (tx, rx) = oneshot::channel();
        self.client.ack.insert(ack_id, tx);
        let _guard = AckGuard {
            waiter: &self.client.ack,
            ack_id,
        };

        let args = serde_json::to_value(args)
            .map_err(|err| AckError::Send(Box::new(EncodeError::Json(err).into())))?;
        let packet = Packet::ack_request(self.state.name.clone(), event, ack_id);

        if let Err(err) = self.send(packet, &args).await {
            return Err(AckError::Send(Box::new(err)));
        }

        let reply = rx.await.map_err(|_| AckError::Closed)?;
        parse_ack_reply(&reply)
    }

    async fn send(&self, packet: Packet, args: &Value) -> Result<(), Error> {
        let text = match args {
            Value::Null => encode(&packet, None)?,
            args => encode(&packet, Some(args))?,
        };

        self.client.write_message(text).await
    }

    fn set_handler(&self, event: &str, handler: Handler) {
        let key = HandlerKey::new(self.state.name.clone(), event);
        self.client.handlers.set(key, Arc::new(handler));
    }
}

/// Releases the pending ack slot unless a reply already consumed it.
struct AckGuard<'a> {
    waiter: &'a AckWaiter,
    ack_id: i64,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        self.waiter.remove(self.ack_id);
    }
}

/// The server replies with a one-element JSON array wrapping the ack value.
fn parse_ack_reply<T: DeserializeOwned>(reply: &str) -> Result<T, AckError> {
    let values: Vec<Value> = serde_json::from_str(reply)?;
    let first = values.into_iter().next().ok_or_else(|| {
        AckError::Decode(<serde_json::Error as serde::de::Error>::custom(
            "empty ack response array",
        ))
    })?;

    serde_json::from_value(first).map_err(AckError::Decode)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ack_reply_takes_first_array_element() {
        let reply: String = parse_ack_reply(r#"["confirmed"]"#).unwrap();
        assert_eq!(reply, "confirmed");

        let reply: Value = parse_ack_reply(r#"[{"status":"ok"},"ignored"]"#).unwrap();
        assert_eq!(reply["status"], "ok");
    }

    #[test]
    fn ack_reply_rejects_empty_array() {
        assert!(matches!(
            parse_ack_reply::<Value>("[]"),
            Err(AckError::Decode(_))
        ));
    }

    #[test]
    fn ack_reply_rejects_non_array() {
        assert!(matches!(
            parse_ack_reply::<Value>(r#""bare""#),
            Err(AckError::Decode(_))
        ));
    }
}
