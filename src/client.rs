/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Client core: dual-socket connect, reconnection, correlators, and the
//! two send queues.
//!
//! A client holds two connections to its domain's server: the shared
//! rendezvous socket (handshake, discovery, relay envelopes) and the
//! per-client unique socket (everything 1-to-1). Every outbound frame
//! rides one of two FIFO queues that buffer while offline and drain once
//! the link is up, so callers never need to care whether the server is
//! reachable right now.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, Frame, FrameDecoder, ERR_NAME_TAKEN};
use crate::config::FabricConfig;
use crate::error::IpcError;
use crate::handler::{dispatch, FrameSink, Handler, HandlerContext, HandlerRegistry};

/// Result of a [`IpcClient::discover`] call.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Discovery {
    /// Friendly names of the clients connected to the domain.
    #[serde(default)]
    pub clients: Vec<String>,

    /// Command names the server has application handlers for.
    #[serde(default)]
    pub command_handlers: Vec<String>,
}

/// Mutually exclusive link flags plus the server-assigned channel id.
#[derive(Debug, Default)]
struct LinkState {
    channel_id: Option<String>,
    connecting: bool,
    connected: bool,
    started: bool,
}

/// State shared between the client handle and its link tasks.
struct ClientShared {
    config: FabricConfig,
    name: String,
    handlers: HandlerRegistry,
    /// Queue for the unique socket: sends and direct deliveries.
    unique_queue: crate::queue::SendQueue,
    /// Queue for the rendezvous socket: emit/broadcast envelopes and
    /// discovery requests.
    bcast_queue: crate::queue::SendQueue,
    /// delivery id → pending result sink.
    deliveries: DashMap<String, oneshot::Sender<Value>>,
    /// Waiters sharing the currently pending discovery, if any.
    discovery: Mutex<Vec<oneshot::Sender<Discovery>>>,
    state: Mutex<LinkState>,
    connected_tx: watch::Sender<bool>,
    /// Kept so `connected_tx.send` never observes a closed channel.
    connected_rx: watch::Receiver<bool>,
    /// Handler-facing write handle; frames land on the unique queue.
    reply_sink: FrameSink,
    /// Receiver side of `reply_sink`, consumed by the forward task on
    /// first connect.
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    cancel: CancellationToken,
}

/// Messaging-fabric client.
///
/// # Example
///
/// ```rust,ignore
/// use ipcio::{FabricConfig, IpcClient};
///
/// let mut config = FabricConfig::for_domain("build-farm");
/// config.name = Some("worker-a".to_string());
///
/// let client = IpcClient::new(config);
/// client.connect().await?;
/// client.send("ping", serde_json::json!({ "seq": 1 })).await?;
/// let answer = client.deliver("sum", serde_json::json!({ "a": 1, "b": 2 })).await?;
/// ```
pub struct IpcClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("domain", &self.shared.config.domain)
            .field("name", &self.shared.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl IpcClient {
    /// Creates a client for the domain named in `config`.
    ///
    /// The friendly name is taken from `config.name`, defaulting to a
    /// random hex UUID. Nothing connects until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: FabricConfig) -> Self {
        let name = config.resolve_name();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (reply_sink, reply_rx) = FrameSink::channel();
        Self {
            shared: Arc::new(ClientShared {
                config,
                name,
                handlers: HandlerRegistry::new(),
                unique_queue: crate::queue::SendQueue::new(),
                bcast_queue: crate::queue::SendQueue::new(),
                deliveries: DashMap::new(),
                discovery: Mutex::new(Vec::new()),
                state: Mutex::new(LinkState::default()),
                connected_tx,
                connected_rx,
                reply_sink,
                reply_rx: Mutex::new(Some(reply_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The client's friendly name on its domain.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The server-assigned channel id, while connected.
    #[must_use]
    pub fn channel_id(&self) -> Option<String> {
        self.shared.state.lock().channel_id.clone()
    }

    /// Whether [`connect`](Self::connect) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Whether the unique socket is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Registers one application handler.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::ReservedCommand`] or
    /// [`IpcError::DuplicateHandler`] on rejection.
    pub fn add_handler(&self, command: &str, handler: Handler) -> Result<(), IpcError> {
        self.shared.handlers.insert(command, handler)
    }

    /// Registers a collection of application handlers.
    ///
    /// # Errors
    ///
    /// Propagates the first rejection; earlier entries stay registered.
    pub fn add_handlers<I, S>(&self, collection: I) -> Result<(), IpcError>
    where
        I: IntoIterator<Item = (S, Handler)>,
        S: AsRef<str>,
    {
        self.shared.handlers.add_handlers(collection)
    }

    /// Connects to the domain's server, resolving once the unique socket
    /// is open and the queues have started draining.
    ///
    /// The link supervisor keeps running afterwards: a dropped connection
    /// re-enters the reconnect loop and queued frames survive until the
    /// next epoch. A client started before its server simply retries every
    /// reconnect interval until the rendezvous socket appears.
    ///
    /// # Errors
    ///
    /// * [`IpcError::AlreadyConnecting`] - `connect` was already called
    ///   and the client is connecting or connected.
    /// * [`IpcError::Disposed`] - the client was closed before the first
    ///   connection completed.
    pub async fn connect(&self) -> Result<(), IpcError> {
        {
            let mut st = self.shared.state.lock();
            if st.connecting || st.connected {
                return Err(IpcError::AlreadyConnecting);
            }
            st.connecting = true;
            st.started = true;
        }
        self.shared.config.check_encoding();

        // Forward handler replies issued through the context sink onto the
        // unique queue.
        if let Some(mut reply_rx) = self.shared.reply_rx.lock().take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        () = shared.cancel.cancelled() => break,
                        frame = reply_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    match codec::encode(&frame) {
                        Ok(bytes) => shared.unique_queue.push(bytes, None),
                        Err(e) => error!(error = %e, "failed to encode handler reply frame"),
                    }
                }
            });
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_link(&shared).await;
        });

        let mut connected = self.shared.connected_rx.clone();
        loop {
            if *connected.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                () = self.shared.cancel.cancelled() => return Err(IpcError::Disposed),
                changed = connected.changed() => changed.map_err(|_| IpcError::Disposed)?,
            }
        }
    }

    /// Sends a command to the server over the unique socket.
    ///
    /// Resolves once the frame has been fully written; while offline the
    /// frame waits on the unique queue.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Disposed`] if the client is closed before the
    /// write happens.
    pub async fn send(&self, command: &str, data: Value) -> Result<(), IpcError> {
        self.enqueue_unique(Frame::command(command, data)).await
    }

    /// Asks the server to relay a command to the named client.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn emit(&self, name: &str, command: &str, data: Value) -> Result<(), IpcError> {
        let envelope = self.relay_envelope(name, command, data, None)?;
        self.enqueue_bcast(envelope).await
    }

    /// Asks the server to broadcast a command to every other client in the
    /// domain. The originator does not receive its own broadcast.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn broadcast(&self, command: &str, data: Value) -> Result<(), IpcError> {
        let inner = Frame::command(command, data);
        let outer = Frame::addressed(
            self.shared.name.clone(),
            "broadcast",
            Value::String(codec::encode_string(&inner)?),
        );
        self.enqueue_bcast(outer).await
    }

    /// Fetches the domain's connected client names and the server's
    /// registered command handlers.
    ///
    /// Concurrent calls share one pending request: a single `discover`
    /// frame goes out and every caller completes from the same reply.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Disposed`] if the client is closed before the
    /// reply arrives.
    pub async fn discover(&self) -> Result<Discovery, IpcError> {
        let bytes = codec::encode(&Frame::command("discover", Value::Null))?;
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.shared.discovery.lock();
            waiters.push(tx);
            waiters.len() == 1
        };
        if first {
            self.shared.bcast_queue.push(bytes, None);
        }
        rx.await.map_err(|_| IpcError::Disposed)
    }

    /// Sends a command to the server and waits for the handler's return
    /// value.
    ///
    /// A fresh delivery id correlates the reply; the result is whatever
    /// the server-side handler returned, JSON null when it returned
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Disposed`] if the client is closed while the
    /// delivery is pending.
    pub async fn deliver(&self, command: &str, data: Value) -> Result<Value, IpcError> {
        let delivery = fresh_delivery_id();
        let frame = Frame::command(command, data).with_delivery(delivery.clone());
        let bytes = codec::encode(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.shared.deliveries.insert(delivery, tx);
        self.shared.unique_queue.push(bytes, None);
        rx.await.map_err(|_| IpcError::Disposed)
    }

    /// Relays a command to the named client and waits for that client's
    /// handler return value.
    ///
    /// # Errors
    ///
    /// As for [`deliver`](Self::deliver).
    pub async fn deliver_to(
        &self,
        name: &str,
        command: &str,
        data: Value,
    ) -> Result<Value, IpcError> {
        let delivery = fresh_delivery_id();
        let envelope = self.relay_envelope(name, command, data, Some(&delivery))?;
        let bytes = codec::encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.shared.deliveries.insert(delivery, tx);
        self.shared.bcast_queue.push(bytes, None);
        rx.await.map_err(|_| IpcError::Disposed)
    }

    /// Tears the link down and discards every pending operation.
    ///
    /// Callers awaiting sends, deliveries, or discoveries observe
    /// [`IpcError::Disposed`]. Dropping the client does the same.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        {
            let mut st = self.shared.state.lock();
            st.channel_id = None;
            st.connected = false;
            st.connecting = false;
        }
        let _ = self.shared.connected_tx.send(false);
        self.shared.unique_queue.clear();
        self.shared.bcast_queue.clear();
        self.shared.deliveries.clear();
        self.shared.discovery.lock().clear();
    }

    /// Builds the outer `emit` envelope wrapping an inner addressed frame.
    ///
    /// The delivery id, when present, rides on both frames: the outer one
    /// tells the server to remember the originator, the inner one tells
    /// the target to reply.
    fn relay_envelope(
        &self,
        name: &str,
        command: &str,
        data: Value,
        delivery: Option<&str>,
    ) -> Result<Frame, IpcError> {
        let mut inner = Frame::addressed(name, command, data);
        inner.delivery = delivery.map(str::to_string);
        let mut outer = Frame::addressed(
            self.shared.name.clone(),
            "emit",
            Value::String(codec::encode_string(&inner)?),
        );
        outer.delivery = delivery.map(str::to_string);
        Ok(outer)
    }

    /// Enqueue on the unique queue and await the write acknowledgment.
    async fn enqueue_unique(&self, frame: Frame) -> Result<(), IpcError> {
        let bytes = codec::encode(&frame)?;
        let (tx, rx) = oneshot::channel();
        self.shared.unique_queue.push(bytes, Some(tx));
        rx.await.map_err(|_| IpcError::Disposed)
    }

    /// Enqueue on the rendezvous queue and await the write acknowledgment.
    async fn enqueue_bcast(&self, frame: Frame) -> Result<(), IpcError> {
        let bytes = codec::encode(&frame)?;
        let (tx, rx) = oneshot::channel();
        self.shared.bcast_queue.push(bytes, Some(tx));
        rx.await.map_err(|_| IpcError::Disposed)
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Generate a fresh delivery correlation id: hex UUIDv4, no dashes.
fn fresh_delivery_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Link supervisor: run connection epochs until disposed, re-entering the
/// reconnect loop after every drop.
async fn run_link(shared: &Arc<ClientShared>) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        match run_epoch(shared).await {
            // A clean return means the client was disposed mid-epoch.
            Ok(()) => break,
            Err(e) => debug!(name = %shared.name, error = %e, "link epoch ended"),
        }
        go_offline(shared);
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = tokio::time::sleep(shared.config.reconnect_delay()) => {}
        }
    }
    go_offline(shared);
}

/// One connection epoch: rendezvous connect, handshake, unique connect,
/// then reads and queue drains until something drops.
async fn run_epoch(shared: &Arc<ClientShared>) -> Result<(), IpcError> {
    let path = shared.config.rendezvous_path();
    let stream = UnixStream::connect(&path)
        .await
        .map_err(|e| IpcError::IoError(format!("rendezvous connect {}: {}", path.display(), e)))?;
    let (mut bcast_reader, mut bcast_writer) = stream.into_split();
    trace!(name = %shared.name, "rendezvous socket open, sending handshake");

    let handshake = codec::encode(&Frame::command(
        "handshake",
        Value::from(shared.name.clone()),
    ))?;
    bcast_writer.write_all(&handshake).await?;
    bcast_writer.flush().await?;

    let mut bcast_decoder = FrameDecoder::new();
    let channel_id = await_handshake(shared, &mut bcast_reader, &mut bcast_decoder).await?;

    let unique_path = shared.config.unique_path(&channel_id);
    let unique = UnixStream::connect(&unique_path).await.map_err(|e| {
        IpcError::IoError(format!("unique connect {}: {}", unique_path.display(), e))
    })?;
    let (mut unique_reader, mut unique_writer) = unique.into_split();

    {
        let mut st = shared.state.lock();
        st.channel_id = Some(channel_id.clone());
        st.connected = true;
        st.connecting = false;
    }
    let _ = shared.connected_tx.send(true);
    info!(name = %shared.name, %channel_id, "connected");

    let mut unique_decoder = FrameDecoder::new();
    tokio::select! {
        biased;
        () = shared.cancel.cancelled() => Ok(()),
        r = shared.unique_queue.drain_loop(&mut unique_writer, &shared.cancel) => r,
        r = shared.bcast_queue.drain_loop(&mut bcast_writer, &shared.cancel) => r,
        r = unique_read_loop(shared, &mut unique_reader, &mut unique_decoder, &channel_id) => r,
        r = bcast_read_loop(shared, &mut bcast_reader, &mut bcast_decoder) => r,
    }
}

/// Wait for the handshake reply addressed to this client's name.
async fn await_handshake(
    shared: &Arc<ClientShared>,
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<String, IpcError> {
    loop {
        let frames = codec::read_frames(reader, decoder).await?;
        for frame in frames {
            match frame.command.as_deref() {
                Some("handshake") if frame.id.as_deref() == Some(shared.name.as_str()) => {
                    let Some(channel_id) = frame.data.as_str() else {
                        return Err(IpcError::ProtocolError(
                            "handshake reply without channel id".to_string(),
                        ));
                    };
                    return Ok(channel_id.to_string());
                }
                Some("error")
                    if frame.data == Value::from(ERR_NAME_TAKEN)
                        && frame.id.as_deref() == Some(shared.name.as_str()) =>
                {
                    warn!(name = %shared.name, "client name already taken on this domain");
                    return Err(IpcError::NameTaken(shared.name.clone()));
                }
                _ => trace!(?frame, "frame before handshake completion ignored"),
            }
        }
    }
}

/// Read loop for the unique socket.
async fn unique_read_loop(
    shared: &Arc<ClientShared>,
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    channel_id: &str,
) -> Result<(), IpcError> {
    loop {
        let frames = codec::read_frames(reader, decoder).await?;
        for frame in frames {
            unique_frame(shared, channel_id, frame).await;
        }
    }
}

/// Dispatch one inbound frame from the unique socket.
async fn unique_frame(shared: &Arc<ClientShared>, channel_id: &str, frame: Frame) {
    if shared.config.verbose {
        debug!(name = %shared.name, ?frame, "unique frame");
    }

    // A reply to one of our deliveries: complete the pending result.
    if frame.command.as_deref() == Some("delivery") {
        if let Some(delivery) = &frame.delivery {
            if let Some((_, pending)) = shared.deliveries.remove(delivery) {
                let _ = pending.send(frame.data);
                return;
            }
        }
        debug!(name = %shared.name, delivery = ?frame.delivery, "delivery frame with unknown correlation id dropped");
        return;
    }

    let result = if let Some(command) = &frame.command {
        dispatch(
            &shared.handlers,
            command,
            HandlerContext {
                data: frame.data.clone(),
                name: shared.name.clone(),
                uuid: Some(channel_id.to_string()),
                socket: Some(shared.reply_sink.clone()),
            },
        )
        .await
    } else {
        Value::Null
    };

    // The sender expects a reply; it travels as a direct send so the
    // server can route it back to the originator.
    if let Some(delivery) = &frame.delivery {
        let reply = Frame::command("delivery", result).with_delivery(delivery.clone());
        match codec::encode(&reply) {
            Ok(bytes) => shared.unique_queue.push(bytes, None),
            Err(e) => error!(error = %e, "failed to encode delivery reply"),
        }
    }
}

/// Read loop for the rendezvous socket: discovery replies and server-side
/// error frames.
async fn bcast_read_loop(
    shared: &Arc<ClientShared>,
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<(), IpcError> {
    loop {
        let frames = codec::read_frames(reader, decoder).await?;
        for frame in frames {
            if shared.config.verbose {
                debug!(name = %shared.name, ?frame, "rendezvous frame");
            }
            match frame.command.as_deref() {
                Some("discover") => {
                    let info: Discovery = serde_json::from_value(frame.data).unwrap_or_default();
                    for waiter in shared.discovery.lock().drain(..) {
                        let _ = waiter.send(info.clone());
                    }
                }
                Some("error") => {
                    warn!(name = %shared.name, data = %frame.data, "error frame from server");
                }
                _ => trace!(?frame, "unhandled rendezvous frame"),
            }
        }
    }
}

/// Enter the offline state: sockets are gone, queues and pending
/// correlations survive for the next epoch.
fn go_offline(shared: &Arc<ClientShared>) {
    {
        let mut st = shared.state.lock();
        st.channel_id = None;
        st.connected = false;
        st.connecting = !shared.cancel.is_cancelled();
    }
    let _ = shared.connected_tx.send(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(domain: &str) -> FabricConfig {
        let mut config = FabricConfig::for_domain(domain);
        // No server in these tests; point at a directory that exists but
        // holds no socket and keep the retry interval short.
        config.socket_dir = std::env::temp_dir();
        config.reconnect_delay = 20;
        config
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let client = Arc::new(IpcClient::new(offline_config("connect-twice")));

        let background = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = client.connect().await;
        assert!(matches!(second, Err(IpcError::AlreadyConnecting)));
        assert!(client.is_started());
        assert!(!client.is_connected());

        client.close();
        let first = background.await.unwrap();
        assert!(matches!(first, Err(IpcError::Disposed)));
    }

    #[tokio::test]
    async fn test_offline_enqueue_returns_pending_result() {
        let client = Arc::new(IpcClient::new(offline_config("offline-enqueue")));

        let send = {
            let client = client.clone();
            tokio::spawn(async move { client.send("ping", Value::Null).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!send.is_finished());

        client.close();
        assert!(matches!(send.await.unwrap(), Err(IpcError::Disposed)));
    }

    #[tokio::test]
    async fn test_close_discards_pending_delivery() {
        let client = Arc::new(IpcClient::new(offline_config("close-delivery")));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.deliver("sum", Value::Null).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        client.close();
        assert!(matches!(pending.await.unwrap(), Err(IpcError::Disposed)));
    }

    #[tokio::test]
    async fn test_default_name_is_hex_uuid() {
        let client = IpcClient::new(offline_config("default-name"));
        assert_eq!(client.name().len(), 32);
        assert!(client.name().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_discovery_deserializes_with_defaults() {
        let info: Discovery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(info.clients.is_empty());
        assert!(info.command_handlers.is_empty());
    }
}
