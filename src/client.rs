//! The client: owns the websocket connection, the ingress and egress loops,
//! the handler registry and the ack waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ack::AckWaiter;
use crate::errors::{AckError, EncodeError, Error, TransportError};
use crate::handler::{split_args, Handler, Handlers, MessageHandler, ReplyHandler};
use crate::ns::{Namespace, NsState};
use crate::packet::{
    decode, encode, OpenHeader, Packet, PacketKind, PING_FRAME, PONG_FRAME,
};
use crate::transport::{ConnectionReader, ConnectionWriter, Transport};
use crate::{ON_CONNECTION, ON_DISCONNECT, ON_ERROR};

/// A socket.io client connection.
///
/// Cloning is cheap and every clone drives the same connection. The
/// event-listener and emit methods operate on the default namespace; use
/// [`Client::of`] for named namespaces.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Dial `url` and wait for the socket.io handshake.
    ///
    /// Blocks until the server acknowledges the connection, an error is
    /// received, or the transport's ping timeout elapses, whichever comes
    /// first.
    pub async fn connect(url: Url, transport: Transport) -> Result<Self, Error> {
        let handshake_timeout = transport.ping_timeout;
        let client = Self::dial(url, transport).await?;

        let (handshake_tx, mut handshake_rx) = mpsc::channel::<()>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<Error>(1);

        client.on(ON_CONNECTION, move || {
            let _ = handshake_tx.try_send(());
        });
        client.on_error(move |err| {
            let _ = error_tx.try_send(err);
        });

        // The open frame may already have been handled before the listeners
        // were in place.
        if client.inner.ensure_namespace("").is_ready() {
            client.off(ON_CONNECTION);
            client.off(ON_ERROR);
            return Ok(client);
        }

        tokio::select! {
            _ = handshake_rx.recv() => {
                client.off(ON_CONNECTION);
                client.off(ON_ERROR);
                Ok(client)
            }
            Some(err) = error_rx.recv() => {
                client.close();
                Err(err)
            }
            _ = tokio::time::sleep(handshake_timeout) => {
                client.close();
                Err(Error::ConnectTimeout(handshake_timeout))
            }
        }
    }

    /// Dial `url` and initialize the socket.io protocol without waiting for
    /// the handshake. You probably want [`Client::connect`] instead.
    pub async fn dial(url: Url, transport: Transport) -> Result<Self, Error> {
        let url = build_url(url);
        tracing::debug!(%url, "dialing");

        let conn = transport.connect(url).await?;
        let (ping_interval, _) = conn.ping_params();
        let (read, write) = conn.split();

        let (out, out_rx) = mpsc::channel(32);
        let inner = Arc::new(ClientInner {
            header: OnceLock::new(),
            handlers: Handlers::new(),
            ack: AckWaiter::new(),
            namespaces: RwLock::new(HashMap::new()),
            out,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(ingress_loop(read, inner.clone()));
        tokio::spawn(egress_loop(write, out_rx, ping_interval, inner.clone()));

        Ok(Self { inner })
    }

    /// The engine.io session id, once the open handshake has been received.
    pub fn id(&self) -> Option<String> {
        self.inner.header.get().map(|header| header.sid.clone())
    }

    /// Register a listener for `event` on the default namespace.
    pub fn on<T, H>(&self, event: &str, handler: H)
    where
        H: MessageHandler<T>,
        T: 'static,
    {
        self.default_namespace().on(event, handler);
    }

    /// Register a listener whose return value answers incoming ack requests
    /// for `event` on the default namespace.
    pub fn on_with_ack<T, H>(&self, event: &str, handler: H)
    where
        H: ReplyHandler<T>,
        T: 'static,
    {
        self.default_namespace().on_with_ack(event, handler);
    }

    /// Register a listener receiving every argument of `event` as a
    /// [`Value`], however many the server sends.
    pub fn on_variadic<F>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.default_namespace().on_variadic(event, handler);
    }

    /// Register the listener for the `error` event of the default namespace.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.default_namespace().on_error(handler);
    }

    /// Unregister the listener for `event` on the default namespace.
    pub fn off(&self, event: &str) {
        self.default_namespace().off(event);
    }

    /// Events with a listener registered on the default namespace.
    pub fn listeners(&self) -> Vec<String> {
        self.default_namespace().listeners()
    }

    /// Emit `event` on the default namespace. See [`Namespace::emit`] for
    /// the argument convention.
    pub async fn emit(&self, event: &str, args: impl Serialize) -> Result<(), Error> {
        self.default_namespace().emit(event, args).await
    }

    /// Emit `event` on the default namespace requesting an acknowledgement,
    /// and wait for the reply. See [`Namespace::ack`].
    pub async fn ack<T, A>(&self, event: &str, args: A) -> Result<T, AckError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        self.default_namespace().ack(event, args).await
    }

    /// Subscribe to a namespace. Namespace names carry their wire form, with
    /// a leading `/`; the default namespace is `""`.
    ///
    /// The handle is cached: the join handshake is only sent on the first
    /// reference to a non-default namespace.
    pub async fn of(&self, name: &str) -> Result<Namespace, Error> {
        if let Some(state) = self.inner.namespace(name) {
            return Ok(Namespace::new(self.inner.clone(), state));
        }

        // Joining a non-default namespace requires a connect packet; the
        // default namespace is implicit.
        if !name.is_empty() {
            let text = encode(&Packet::namespace_connect(name), None)?;
            self.inner.write_message(text).await?;
        }

        Ok(Namespace::new(
            self.inner.clone(),
            self.inner.ensure_namespace(name),
        ))
    }

    /// Close the connection. Idempotent; fires `disconnect` on the default
    /// namespace the first time.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("closing client");
        self.inner.cancel.cancel();
        self.inner.call_internal_event("", ON_DISCONNECT);
    }

    fn default_namespace(&self) -> Namespace {
        Namespace::new(self.inner.clone(), self.inner.ensure_namespace(""))
    }
}

/// Shared state behind every [`Client`] and [`Namespace`] handle.
pub(crate) struct ClientInner {
    header: OnceLock<OpenHeader>,
    pub(crate) handlers: Handlers,
    pub(crate) ack: AckWaiter,
    namespaces: RwLock<HashMap<String, Arc<NsState>>>,
    out: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// A frame submitted to the egress loop, with a completion handle so the
/// caller observes the write result synchronously.
struct WriteRequest {
    text: String,
    done: oneshot::Sender<Result<(), TransportError>>,
}

impl ClientInner {
    /// Submit one frame to the egress loop and wait for the write to
    /// complete. The egress loop is the single writer into the socket.
    pub(crate) async fn write_message(&self, text: String) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.out
            .send(WriteRequest { text, done })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?.map_err(Error::from)
    }

    fn namespace(&self, name: &str) -> Option<Arc<NsState>> {
        self.namespaces.read().unwrap().get(name).cloned()
    }

    pub(crate) fn ensure_namespace(&self, name: &str) -> Arc<NsState> {
        if let Some(state) = self.namespaces.read().unwrap().get(name) {
            return state.clone();
        }

        self.namespaces
            .write()
            .unwrap()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(NsState::new(name)))
            .clone()
    }

    async fn handle_incoming(&self, packet: Packet) {
        match packet.kind {
            PacketKind::Open => self.handle_open(&packet),
            PacketKind::Ping => {
                if let Err(err) = self.write_message(PONG_FRAME.to_owned()).await {
                    self.fire_error("", err);
                }
            }
            PacketKind::Pong => {}
            PacketKind::Error => {
                let err = Error::Protocol {
                    event: packet.event.clone(),
                    nsp: packet.nsp.clone(),
                };
                self.fire_error(&packet.nsp, err);
            }
            PacketKind::Emit => self.handle_emit(&packet),
            PacketKind::AckRequest => self.handle_ack_request(&packet).await,
            PacketKind::AckResponse => self.handle_ack_response(&packet),
            PacketKind::Empty => {
                if !packet.nsp.is_empty() {
                    self.ensure_namespace(&packet.nsp).set_ready();
                    self.call_internal_event(&packet.nsp, &packet.event);
                }
            }
            // Close ends the ingress loop before dispatch; namespace connect
            // packets are never received.
            PacketKind::Close | PacketKind::NamespaceConnect => {}
        }
    }

    fn handle_open(&self, packet: &Packet) {
        let header: OpenHeader = match serde_json::from_str(&packet.data) {
            Ok(header) => header,
            Err(err) => {
                self.fire_error("", Error::OpenPayload(err));
                return;
            }
        };

        tracing::debug!(sid = %header.sid, "session opened");
        let _ = self.header.set(header);

        self.ensure_namespace("").set_ready();
        self.call_internal_event(&packet.nsp, ON_CONNECTION);
    }

    fn handle_emit(&self, packet: &Packet) {
        let Some(handler) = self.handlers.get(&packet.nsp, &packet.event) else {
            return;
        };
        let Handler::Event(handler) = handler.as_ref() else {
            return;
        };

        let called = split_args(&packet.data).and_then(|args| handler.call(&packet.event, &args));
        if let Err(err) = called {
            self.fire_error(&packet.nsp, err.into());
        }
    }

    async fn handle_ack_request(&self, packet: &Packet) {
        let Some(handler) = self.handlers.get(&packet.nsp, &packet.event) else {
            return;
        };
        let Handler::Event(handler) = handler.as_ref() else {
            return;
        };
        if !handler.produces_reply() {
            return;
        }

        let called = split_args(&packet.data).and_then(|args| handler.call(&packet.event, &args));
        let reply = match called {
            Ok(reply) => reply.unwrap_or(Value::Null),
            Err(err) => {
                self.fire_error(&packet.nsp, err.into());
                return;
            }
        };

        let data = match serde_json::to_string(&[reply]) {
            Ok(data) => data,
            Err(err) => {
                self.fire_error(&packet.nsp, EncodeError::Json(err).into());
                return;
            }
        };

        let response = Packet::ack_response(packet.ack_id.unwrap_or(0), data);
        match encode(&response, None) {
            Ok(text) => {
                if let Err(err) = self.write_message(text).await {
                    self.fire_error(&packet.nsp, err);
                }
            }
            Err(err) => self.fire_error(&packet.nsp, err.into()),
        }
    }

    fn handle_ack_response(&self, packet: &Packet) {
        let Some(ack_id) = packet.ack_id else { return };

        if let Some(slot) = self.ack.take(ack_id) {
            let _ = slot.send(packet.data.clone());
        }
        // replies with no pending ack are dropped
    }

    /// Fire an event generated by the client itself. Internal events carry
    /// no payload, so only parameterless listeners can observe them.
    fn call_internal_event(&self, nsp: &str, event: &str) {
        let Some(handler) = self.handlers.get(nsp, event) else {
            return;
        };
        let Handler::Event(handler) = handler.as_ref() else {
            return;
        };
        if handler.arity() != 0 {
            return;
        }

        if let Err(err) = handler.call(event, &[]) {
            self.fire_error(nsp, err.into());
        }
    }

    fn fire_error(&self, nsp: &str, err: Error) {
        tracing::debug!(nsp, error = %err, "client error");

        if let Some(handler) = self.handlers.get(nsp, ON_ERROR) {
            if let Handler::Error(handler) = handler.as_ref() {
                handler(err);
            }
        }
    }
}

/// Read frames, decode and dispatch them until the connection dies.
///
/// Content-level transport errors and decode errors fire `error` and keep
/// the loop alive; a failed read fires `error` and cancels the client.
async fn ingress_loop(mut read: ConnectionReader, inner: Arc<ClientInner>) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            frame = read.get_message() => frame,
        };

        let text = match frame {
            Ok(text) => text,
            Err(err) if err.is_recoverable() => {
                inner.fire_error("", err.into());
                continue;
            }
            Err(err) => {
                tracing::debug!(error = %err, "read failed, shutting down");
                inner.fire_error("", err.into());
                inner.cancel.cancel();
                return;
            }
        };

        let packet = match decode(&text) {
            Ok(packet) => packet,
            Err(err) => {
                inner.fire_error("", err.into());
                continue;
            }
        };

        tracing::trace!(kind = ?packet.kind, nsp = %packet.nsp, "frame received");

        if packet.kind == PacketKind::Close {
            tracing::debug!("server closed the session");
            return;
        }

        inner.handle_incoming(packet).await;
    }
}

/// Drain write requests and drive the ping ticker. This loop owns the socket
/// writer; nothing else writes to the connection.
async fn egress_loop(
    mut write: ConnectionWriter,
    mut out: mpsc::Receiver<WriteRequest>,
    ping_interval: Duration,
    inner: Arc<ClientInner>,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = write.close().await;
                return;
            }
            request = out.recv() => {
                let Some(WriteRequest { text, done }) = request else { return };
                tracing::trace!(frame = %text, "writing frame");
                let result = write.write_message(&text).await;
                let _ = done.send(result);
            }
            _ = ticker.tick() => {
                tracing::trace!("emitting ping");
                if let Err(err) = write.write_message(PING_FRAME).await {
                    inner.fire_error("", err.into());
                }
            }
        }
    }
}

/// Adjust a caller-supplied URL for the engine.io websocket endpoint: the
/// query carries `EIO=3` and `transport=websocket`, the path is suffixed
/// with `/socket.io/`.
fn build_url(mut url: Url) -> Url {
    url.query_pairs_mut()
        .append_pair("EIO", "3")
        .append_pair("transport", "websocket");

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}
