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

//! Server core: rendezvous listener, client registry, relay router, and
//! delivery forwarder.
//!
//! One server owns one domain. Clients arrive on the shared rendezvous
//! socket for handshake and relay traffic; each handshaked client gets a
//! transient listener at `<rendezvous-path>.<uuid>` that accepts exactly
//! one connection, after which all 1-to-1 traffic for that client flows on
//! the accepted unique socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, Frame, FrameDecoder, ERR_NAME_TAKEN};
use crate::config::FabricConfig;
use crate::error::IpcError;
use crate::handler::{dispatch, FrameSink, Handler, HandlerContext, HandlerRegistry};

/// Per-client state, keyed by channel id.
///
/// The rendezvous connection itself is owned by its handler task; the
/// record only carries what other tasks need to reach this client.
struct ClientRecord {
    /// Friendly name, unique across the domain while connected.
    name: String,
    /// Writer for the accepted unique socket; `None` between handshake and
    /// accept.
    unique: Mutex<Option<FrameSink>>,
}

/// State shared by the accept loop and every connection task.
struct ServerShared {
    config: FabricConfig,
    handlers: HandlerRegistry,
    /// channel id → client record.
    clients: DashMap<String, ClientRecord>,
    /// friendly name → channel id. A bijection over connected clients.
    names: DashMap<String, String>,
    /// delivery id → originator friendly name.
    deliveries: DashMap<String, String>,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// Messaging-fabric server for one domain.
///
/// # Example
///
/// ```rust,ignore
/// use ipcio::{handler, FabricConfig, IpcServer};
///
/// let server = IpcServer::new(FabricConfig::for_domain("build-farm"));
/// server.add_handlers([(
///     "sum",
///     handler(|ctx| async move {
///         let a = ctx.data["a"].as_i64().unwrap_or(0);
///         let b = ctx.data["b"].as_i64().unwrap_or(0);
///         Some(serde_json::json!({ "r": a + b }))
///     }),
/// )])?;
/// server.start().await?;
/// ```
pub struct IpcServer {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("domain", &self.shared.config.domain)
            .field("started", &self.is_started())
            .field("clients", &self.shared.clients.len())
            .finish()
    }
}

impl IpcServer {
    /// Creates a server for the domain named in `config`. Nothing binds
    /// until [`start`](Self::start).
    #[must_use]
    pub fn new(config: FabricConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                handlers: HandlerRegistry::new(),
                clients: DashMap::new(),
                names: DashMap::new(),
                deliveries: DashMap::new(),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
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

    /// Binds the rendezvous socket and begins accepting clients.
    ///
    /// Any stale socket file left by a previous process is unlinked before
    /// binding. Clients may arrive before or after this call; a client
    /// started first simply retries until the socket exists.
    ///
    /// # Errors
    ///
    /// * [`IpcError::AlreadyStarted`] - `start` was already called.
    /// * [`IpcError::IoError`] - the socket could not be bound.
    pub async fn start(&self) -> Result<(), IpcError> {
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IpcError::AlreadyStarted);
        }

        let path = self.shared.config.rendezvous_path();
        self.shared.config.check_encoding();

        match tokio::fs::remove_file(&path).await {
            Ok(()) => warn!("Removed stale rendezvous socket: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.shared.started.store(false, Ordering::SeqCst);
                return Err(IpcError::IoError(format!(
                    "Failed to remove stale socket {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            self.shared.started.store(false, Ordering::SeqCst);
            IpcError::IoError(format!("Failed to bind socket at {}: {}", path.display(), e))
        })?;

        info!(domain = %self.shared.config.domain, "fabric listening on: {}", path.display());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            accept_loop(&shared, listener).await;

            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("Failed to remove socket file on shutdown: {}", e);
            }
            info!(domain = %shared.config.domain, "fabric listener shut down");
        });

        Ok(())
    }

    /// Whether [`start`](Self::start) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Stops accepting connections and tears down every client task.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Writes a frame to the named client's unique socket.
    ///
    /// A silent no-op when no such client is connected or its socket is no
    /// longer writable.
    pub fn emit(&self, name: &str, command: &str, data: Value) {
        emit_frame(&self.shared, name, Some(command), data, None);
    }

    /// [`emit`](Self::emit) with a delivery correlation id attached, asking
    /// the client to reply with a `delivery` frame.
    pub fn emit_with_delivery(&self, name: &str, command: &str, data: Value, delivery: &str) {
        emit_frame(&self.shared, name, Some(command), data, Some(delivery));
    }

    /// Writes a frame to every connected client's unique socket.
    pub fn broadcast(&self, command: &str, data: Value) {
        broadcast_frame(&self.shared, command, data, None);
    }

    /// Names of the clients currently connected, sorted.
    #[must_use]
    pub fn client_names(&self) -> Vec<String> {
        client_names(&self.shared)
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Spawn the writer task owning one socket's write half.
///
/// Frames queued on the returned sink are encoded and written in order;
/// the task ends on write failure or when every sink clone is gone, and
/// frames sent afterwards are dropped silently.
fn spawn_writer(mut writer: OwnedWriteHalf, cancel: CancellationToken, verbose: bool) -> FrameSink {
    let (sink, mut rx) = FrameSink::channel();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let bytes = match codec::encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if verbose {
                debug!(?frame, "writing frame");
            }
            if let Err(e) = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            }
            .await
            {
                debug!(error = %e, "socket writer stopped");
                break;
            }
        }
    });
    sink
}

/// Main accept loop for the rendezvous listener.
async fn accept_loop(shared: &Arc<ServerShared>, listener: UnixListener) {
    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => {
                info!("fabric listener received shutdown signal");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let channel_id = uuid::Uuid::new_v4().simple().to_string();
                        trace!(%channel_id, "accepted rendezvous connection");

                        let shared = shared.clone();
                        tokio::spawn(async move {
                            handle_rendezvous(&shared, stream, channel_id).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Handle one rendezvous connection for its whole lifetime.
async fn handle_rendezvous(shared: &Arc<ServerShared>, stream: UnixStream, channel_id: String) {
    let (mut reader, writer) = stream.into_split();
    let sink = spawn_writer(writer, shared.cancel.child_token(), shared.config.verbose);
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break,

            frames = codec::read_frames(&mut reader, &mut decoder) => {
                match frames {
                    Ok(frames) => {
                        for frame in frames {
                            rendezvous_frame(shared, &channel_id, &sink, frame).await;
                        }
                    }
                    Err(IpcError::ConnectionClosed) => {
                        debug!(%channel_id, "rendezvous connection closed by client");
                        break;
                    }
                    Err(e) => {
                        warn!(%channel_id, error = %e, "rendezvous connection error");
                        break;
                    }
                }
            }
        }
    }

    remove_client(shared, &channel_id);
}

/// Dispatch one inbound rendezvous frame by command.
async fn rendezvous_frame(
    shared: &Arc<ServerShared>,
    channel_id: &str,
    sink: &FrameSink,
    frame: Frame,
) {
    if shared.config.verbose {
        debug!(%channel_id, ?frame, "rendezvous frame");
    }

    match frame.command.as_deref() {
        Some("handshake") => handshake(shared, channel_id, sink, &frame),
        Some("discover") => {
            let Some(name) = client_name(shared, channel_id) else {
                warn!(%channel_id, "discover before handshake ignored");
                return;
            };
            sink.send(Frame::addressed(
                name,
                "discover",
                json!({
                    "clients": client_names(shared),
                    "command_handlers": shared.handlers.command_names(),
                }),
            ));
        }
        Some("broadcast") => {
            let Some(name) = client_name(shared, channel_id) else {
                warn!(%channel_id, "broadcast before handshake ignored");
                return;
            };
            let Some(inner) = codec::parse_inner(&frame.data) else {
                warn!(%channel_id, "broadcast envelope without inner frame");
                return;
            };
            let Some(command) = inner.command else {
                warn!(%channel_id, "broadcast inner frame without command");
                return;
            };
            broadcast_frame(shared, &command, inner.data, Some(&name));
        }
        Some("emit") => {
            let Some(name) = client_name(shared, channel_id) else {
                warn!(%channel_id, "emit before handshake ignored");
                return;
            };
            let Some(inner) = codec::parse_inner(&frame.data) else {
                warn!(%channel_id, "emit envelope without inner frame");
                return;
            };
            let Some(target) = inner.id else {
                warn!(%channel_id, "emit inner frame without target name");
                return;
            };
            // A correlated relay: remember who asked so the reply finds
            // its way back.
            if let Some(delivery) = &frame.delivery {
                shared.deliveries.insert(delivery.clone(), name);
            }
            emit_frame(
                shared,
                &target,
                inner.command.as_deref(),
                inner.data,
                inner.delivery.as_deref(),
            );
        }
        other => {
            trace!(%channel_id, command = ?other, "unhandled rendezvous frame");
        }
    }
}

/// Process a handshake request: reserve the name, open the unique
/// listener, and reply with the channel id.
fn handshake(shared: &Arc<ServerShared>, channel_id: &str, sink: &FrameSink, frame: &Frame) {
    let Some(name) = frame.data.as_str() else {
        warn!(%channel_id, "handshake without a client name");
        return;
    };
    if name.is_empty() {
        warn!(%channel_id, "handshake with empty client name");
        return;
    }

    // Reserve the name atomically; a taken name gets the 201 error frame
    // and the record is left untouched so the holder is unaffected.
    match shared.names.entry(name.to_string()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            debug!(%channel_id, name, "handshake rejected: name taken");
            sink.send(Frame::addressed(name, "error", Value::from(ERR_NAME_TAKEN)));
            return;
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(channel_id.to_string());
        }
    }

    let path = shared.config.unique_path(channel_id);
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(%channel_id, error = %e, "Failed to bind unique socket at {}", path.display());
            shared.names.remove(name);
            return;
        }
    };

    shared.clients.insert(
        channel_id.to_string(),
        ClientRecord {
            name: name.to_string(),
            unique: Mutex::new(None),
        },
    );

    debug!(%channel_id, name, "handshake accepted");
    sink.send(Frame::addressed(name, "handshake", Value::from(channel_id)));

    let shared = shared.clone();
    let channel_id = channel_id.to_string();
    tokio::spawn(async move {
        accept_unique(&shared, &channel_id, listener, path).await;
    });
}

/// Accept exactly one connection on a client's unique listener, then close
/// the listener and run the unique-socket read loop.
async fn accept_unique(
    shared: &Arc<ServerShared>,
    channel_id: &str,
    listener: UnixListener,
    path: std::path::PathBuf,
) {
    let stream = tokio::select! {
        biased;
        () = shared.cancel.cancelled() => return,
        accept_result = listener.accept() => match accept_result {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                error!(%channel_id, error = %e, "Failed to accept unique connection");
                remove_client(shared, channel_id);
                return;
            }
        },
    };

    // One connection per listener; the socket file has served its purpose.
    drop(listener);
    let _ = tokio::fs::remove_file(&path).await;

    let (mut reader, writer) = stream.into_split();
    let sink = spawn_writer(writer, shared.cancel.child_token(), shared.config.verbose);

    {
        let Some(record) = shared.clients.get(channel_id) else {
            debug!(%channel_id, "client record gone before unique accept");
            return;
        };
        *record.unique.lock() = Some(sink.clone());
        trace!(%channel_id, name = %record.name, "unique socket established");
    }

    let mut decoder = FrameDecoder::new();
    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break,

            frames = codec::read_frames(&mut reader, &mut decoder) => {
                match frames {
                    Ok(frames) => {
                        for frame in frames {
                            unique_frame(shared, channel_id, &sink, frame).await;
                        }
                    }
                    Err(IpcError::ConnectionClosed) => {
                        debug!(%channel_id, "unique socket closed by client");
                        break;
                    }
                    Err(e) => {
                        warn!(%channel_id, error = %e, "unique socket error");
                        break;
                    }
                }
            }
        }
    }

    remove_client(shared, channel_id);
}

/// Dispatch one inbound frame from a client's unique socket.
async fn unique_frame(
    shared: &Arc<ServerShared>,
    channel_id: &str,
    sink: &FrameSink,
    frame: Frame,
) {
    if shared.config.verbose {
        debug!(%channel_id, ?frame, "unique frame");
    }

    // A callee's reply: route it back to whoever initiated the delivery.
    if frame.command.as_deref() == Some("delivery") {
        if let Some(delivery) = &frame.delivery {
            if let Some((_, originator)) = shared.deliveries.remove(delivery) {
                emit_frame(
                    shared,
                    &originator,
                    Some("delivery"),
                    frame.data,
                    Some(delivery.as_str()),
                );
                return;
            }
        }
        debug!(%channel_id, delivery = ?frame.delivery, "delivery reply with unknown correlation id dropped");
        return;
    }

    let Some(name) = client_name(shared, channel_id) else {
        debug!(%channel_id, "frame from unregistered unique socket dropped");
        return;
    };

    let result = if let Some(command) = &frame.command {
        dispatch(
            &shared.handlers,
            command,
            HandlerContext {
                data: frame.data.clone(),
                name: name.clone(),
                uuid: Some(channel_id.to_string()),
                socket: Some(sink.clone()),
            },
        )
        .await
    } else {
        Value::Null
    };

    // The sender expects a reply: whatever the handler returned (null when
    // it returned nothing) completes the remote pending result.
    if let Some(delivery) = &frame.delivery {
        emit_frame(shared, &name, Some("delivery"), result, Some(delivery.as_str()));
    }
}

/// Write a frame to the named client's unique socket, silently dropping it
/// when the client or its socket is gone.
fn emit_frame(
    shared: &Arc<ServerShared>,
    name: &str,
    command: Option<&str>,
    data: Value,
    delivery: Option<&str>,
) {
    let Some(channel_id) = shared.names.get(name).map(|entry| entry.value().clone()) else {
        trace!(name, "emit target not connected, frame dropped");
        return;
    };
    let Some(record) = shared.clients.get(&channel_id) else {
        trace!(name, "emit target record gone, frame dropped");
        return;
    };
    let Some(sink) = record.unique.lock().clone() else {
        trace!(name, "emit target unique socket not established, frame dropped");
        return;
    };

    sink.send(Frame {
        id: Some(name.to_string()),
        command: command.map(str::to_string),
        data,
        delivery: delivery.map(str::to_string),
    });
}

/// Write a frame to every connected client's unique socket, skipping the
/// client whose name equals `initiator`.
fn broadcast_frame(shared: &Arc<ServerShared>, command: &str, data: Value, initiator: Option<&str>) {
    for record in &shared.clients {
        if initiator == Some(record.name.as_str()) {
            continue;
        }
        let Some(sink) = record.unique.lock().clone() else {
            continue;
        };
        sink.send(Frame::command(command, data.clone()));
    }
}

/// Friendly name for a channel id, when handshaked.
fn client_name(shared: &Arc<ServerShared>, channel_id: &str) -> Option<String> {
    shared
        .clients
        .get(channel_id)
        .map(|record| record.name.clone())
}

/// Names of the clients currently connected, sorted.
fn client_names(shared: &Arc<ServerShared>) -> Vec<String> {
    let mut names: Vec<String> = shared.names.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
}

/// Drop a client's record and free its name.
///
/// Disconnection of either socket lands here; the name becomes available
/// for a new handshake immediately.
fn remove_client(shared: &Arc<ServerShared>, channel_id: &str) {
    if let Some((_, record)) = shared.clients.remove(channel_id) {
        shared
            .names
            .remove_if(&record.name, |_, registered| registered == channel_id);
        debug!(%channel_id, name = %record.name, "client removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FabricConfig::for_domain("start-twice");
        config.socket_dir = dir.path().to_path_buf();

        let server = IpcServer::new(config);
        server.start().await.unwrap();
        assert!(server.is_started());

        let result = server.start().await;
        assert!(matches!(result, Err(IpcError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_start_unlinks_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FabricConfig::for_domain("stale");
        config.socket_dir = dir.path().to_path_buf();

        // A leftover file from a dead process must not block startup.
        std::fs::write(config.rendezvous_path(), b"stale").unwrap();

        let server = IpcServer::new(config.clone());
        server.start().await.unwrap();

        // The path now holds a live socket, not the stale file.
        tokio::net::UnixStream::connect(config.rendezvous_path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_emit_to_unknown_client_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FabricConfig::for_domain("emit-unknown");
        config.socket_dir = dir.path().to_path_buf();

        let server = IpcServer::new(config);
        // No clients, not even started: must be a no-op, not a panic.
        server.emit("ghost", "ping", Value::Null);
        server.broadcast("ping", Value::Null);
        assert!(server.client_names().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_handler_rejected() {
        let server = IpcServer::new(FabricConfig::default());
        let result = server.add_handler("delivery", crate::handler::handler(|_| async { None }));
        assert!(matches!(result, Err(IpcError::ReservedCommand(_))));
    }
}
