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

//! Command handler registry and dispatch.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::Frame;
use crate::error::IpcError;

/// Command names owned by the fabric itself.
///
/// Registering an application handler under any of these fails with
/// [`IpcError::ReservedCommand`]; their semantics are fixed by the wire
/// protocol.
pub const RESERVED_COMMANDS: [&str; 6] = [
    "handshake",
    "discover",
    "broadcast",
    "emit",
    "delivery",
    "error",
];

/// Boxed future returned by a command handler.
pub type HandlerFuture = BoxFuture<'static, Option<Value>>;

/// An erased, shareable command handler.
///
/// The return value is meaningful only when the inbound frame carried a
/// `delivery` id: it becomes the `data` of the reply, with `None`
/// normalized to JSON null so the remote pending result still completes.
pub type Handler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
///
/// # Example
///
/// ```rust,ignore
/// use ipcio::handler;
///
/// let sum = handler(|ctx| async move {
///     let a = ctx.data["a"].as_i64().unwrap_or(0);
///     let b = ctx.data["b"].as_i64().unwrap_or(0);
///     Some(serde_json::json!({ "r": a + b }))
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Value>> + Send + 'static,
{
    Arc::new(move |ctx| -> HandlerFuture { Box::pin(f(ctx)) })
}

/// Context passed to a command handler for one inbound frame.
///
/// On the server side `name` is the origin client's friendly name; on the
/// client side it is the client's own name. `uuid` is the channel id of
/// the unique socket the frame arrived on, when known.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// The frame's `data` payload.
    pub data: Value,

    /// Friendly client name associated with the frame.
    pub name: String,

    /// Channel id of the owning unique socket.
    pub uuid: Option<String>,

    /// Write handle for the owning socket, or `None` when it is gone.
    pub socket: Option<FrameSink>,
}

/// Write handle for one socket.
///
/// Cloneable and cheap; frames sent after the socket has closed are
/// dropped silently, matching the fabric's write semantics for dead peers.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink").finish_non_exhaustive()
    }
}

impl FrameSink {
    /// Creates a sink and the receiving end its owner drains.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for writing.
    ///
    /// A no-op when the owning socket has already closed.
    pub fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            trace!("frame dropped: socket writer gone");
        }
    }

    /// Whether the owning socket writer is still alive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Registry mapping command names to handlers.
///
/// Safe to share across tasks; registration and dispatch may happen
/// concurrently.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Handler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_commands", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one command name.
    ///
    /// # Errors
    ///
    /// * [`IpcError::ReservedCommand`] - the name is one of
    ///   [`RESERVED_COMMANDS`].
    /// * [`IpcError::DuplicateHandler`] - a handler is already registered
    ///   under this name.
    pub fn insert(&self, command: &str, handler: Handler) -> Result<(), IpcError> {
        if RESERVED_COMMANDS.contains(&command) {
            return Err(IpcError::ReservedCommand(command.to_string()));
        }
        match self.handlers.entry(command.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(IpcError::DuplicateHandler(command.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Registers a collection of handlers, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// Propagates the first [`IpcError::ReservedCommand`] or
    /// [`IpcError::DuplicateHandler`]; earlier entries stay registered.
    pub fn add_handlers<I, S>(&self, collection: I) -> Result<(), IpcError>
    where
        I: IntoIterator<Item = (S, Handler)>,
        S: AsRef<str>,
    {
        for (command, handler) in collection {
            self.insert(command.as_ref(), handler)?;
        }
        Ok(())
    }

    /// Looks up the handler for a command.
    #[must_use]
    pub fn get(&self, command: &str) -> Option<Handler> {
        self.handlers.get(command).map(|entry| entry.value().clone())
    }

    /// Registered command names, sorted for stable discovery replies.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Invoke the handler registered for `command`, normalizing a missing
/// handler or `None` return to JSON null.
pub(crate) async fn dispatch(
    registry: &HandlerRegistry,
    command: &str,
    ctx: HandlerContext,
) -> Value {
    match registry.get(command) {
        Some(h) => h(ctx).await.unwrap_or(Value::Null),
        None => {
            trace!(command, "no handler registered for inbound command");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_handler() -> Handler {
        handler(|ctx| async move { Some(ctx.data) })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.insert("ping", echo_handler()).unwrap();

        assert!(registry.get("ping").is_some());
        assert!(registry.get("pong").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let registry = HandlerRegistry::new();
        for name in RESERVED_COMMANDS {
            let result = registry.insert(name, echo_handler());
            assert!(
                matches!(result, Err(IpcError::ReservedCommand(_))),
                "{name} must be rejected"
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = HandlerRegistry::new();
        registry.insert("ping", echo_handler()).unwrap();

        let result = registry.insert("ping", echo_handler());
        assert!(matches!(result, Err(IpcError::DuplicateHandler(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_handlers_collection() {
        let registry = HandlerRegistry::new();
        registry
            .add_handlers([("a", echo_handler()), ("b", echo_handler())])
            .unwrap();

        assert_eq!(registry.command_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_add_handlers_stops_at_reserved() {
        let registry = HandlerRegistry::new();
        let result =
            registry.add_handlers([("a", echo_handler()), ("broadcast", echo_handler())]);

        assert!(matches!(result, Err(IpcError::ReservedCommand(_))));
        assert!(registry.get("a").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_returns_handler_value() {
        let registry = HandlerRegistry::new();
        registry.insert("sum", echo_handler()).unwrap();

        let ctx = HandlerContext {
            data: json!({"x": 1}),
            name: "c1".to_string(),
            uuid: None,
            socket: None,
        };
        assert_eq!(dispatch(&registry, "sum", ctx).await, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_dispatch_normalizes_missing_to_null() {
        let registry = HandlerRegistry::new();
        registry
            .insert("fire", handler(|_ctx| async move { None }))
            .unwrap();

        let ctx = HandlerContext {
            data: Value::Null,
            name: "c1".to_string(),
            uuid: None,
            socket: None,
        };
        assert_eq!(dispatch(&registry, "fire", ctx.clone()).await, Value::Null);
        assert_eq!(dispatch(&registry, "unknown", ctx).await, Value::Null);
    }

    #[tokio::test]
    async fn test_frame_sink_drops_after_close() {
        let (sink, rx) = FrameSink::channel();
        assert!(sink.is_open());

        drop(rx);
        assert!(!sink.is_open());
        // Must not panic.
        sink.send(Frame::command("ping", Value::Null));
    }
}
