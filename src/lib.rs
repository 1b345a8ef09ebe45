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

#![forbid(unsafe_code)]
#![forbid(missing_docs)] // Keep this to enforce coverage

//! # ipcio
//!
//! A local inter-process messaging fabric built on Unix-domain stream
//! sockets. Peers within a named *domain* exchange JSON-encoded commands
//! through a server: point-to-point from client to server, point-to-point
//! from server to a named client, and fan-out broadcast to every client in
//! the domain except the originator. A client may also ask the server to
//! relay a command to another named client, fire-and-forget (`emit`) or
//! with a correlated reply (`deliver`).
//!
//! ## Key Concepts
//!
//! - **Domain**: namespace selecting the shared rendezvous socket at
//!   `/tmp/IPC.io.<domain>`. All clients in a domain meet there.
//! - **Unique socket**: on handshake the server opens a transient listener
//!   at `/tmp/IPC.io.<domain>.<uuid>`, accepts exactly one connection from
//!   that client, and carries all 1-to-1 traffic on it afterwards.
//! - **Frame**: one JSON object with `id`, `command`, `data`, and
//!   `delivery` fields, concatenated back-to-back on the wire.
//! - **Send queues**: outbound frames buffer per socket while the link is
//!   down and drain in FIFO order once it is up, so reconnection is
//!   invisible to callers.
//! - **Handlers**: applications register async callbacks per command name;
//!   a handler's return value answers correlated deliveries.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ipcio::{handler, FabricConfig, IpcClient, IpcServer};
//!
//! let server = IpcServer::new(FabricConfig::for_domain("demo"));
//! server.add_handler(
//!     "sum",
//!     handler(|ctx| async move {
//!         let a = ctx.data["a"].as_i64().unwrap_or(0);
//!         let b = ctx.data["b"].as_i64().unwrap_or(0);
//!         Some(serde_json::json!({ "r": a + b }))
//!     }),
//! )?;
//! server.start().await?;
//!
//! let mut config = FabricConfig::for_domain("demo");
//! config.name = Some("calc-user".to_string());
//! let client = IpcClient::new(config);
//! client.connect().await?;
//!
//! let answer = client.deliver("sum", serde_json::json!({ "a": 1, "b": 2 })).await?;
//! assert_eq!(answer["r"], 3);
//! ```

/// Client core: dual-socket connect, reconnection, and correlators.
pub mod client;

/// Framed JSON message codec with stream reassembly.
pub mod codec;

/// Fabric configuration and socket path handling.
pub mod config;

/// Error types for fabric operations.
pub mod error;

/// Command handler registry and dispatch.
pub mod handler;

/// Per-socket FIFO send queues.
pub mod queue;

/// Server core: rendezvous listener, client registry, and relay router.
pub mod server;

pub use client::{Discovery, IpcClient};
pub use codec::{Frame, FrameDecoder, ERR_NAME_TAKEN, ERR_NOT_ARRAY, ERR_NOT_JSON};
pub use config::{FabricConfig, DEFAULT_RECONNECT_DELAY_MS};
pub use error::IpcError;
pub use handler::{handler, FrameSink, Handler, HandlerContext, HandlerRegistry, RESERVED_COMMANDS};
pub use server::IpcServer;

/// A prelude module for conveniently importing the most commonly used
/// items.
pub mod prelude {
    pub use crate::client::{Discovery, IpcClient};
    pub use crate::codec::Frame;
    pub use crate::config::FabricConfig;
    pub use crate::error::IpcError;
    pub use crate::handler::{handler, Handler, HandlerContext};
    pub use crate::server::IpcServer;
}
