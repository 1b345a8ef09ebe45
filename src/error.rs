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

//! Error types for fabric operations.

use std::fmt;

/// Error types for fabric operations.
///
/// These errors can occur during registration, connection management,
/// message framing, or transport operations.
#[derive(Debug, Clone)]
pub enum IpcError {
    /// `start` was called on a server that is already started.
    AlreadyStarted,

    /// `connect` was called while the client is already connecting or
    /// connected.
    AlreadyConnecting,

    /// The requested friendly name is already registered on this domain.
    ///
    /// Carried back to the offending client as an `error` frame with data
    /// code `201`; the client's reconnect loop retries after the delay.
    NameTaken(String),

    /// Attempted to register a handler under a reserved command name.
    ReservedCommand(String),

    /// Attempted to register a second handler for the same command.
    DuplicateHandler(String),

    /// Connection was closed by the peer.
    ConnectionClosed,

    /// Protocol error (malformed handshake reply, unexpected frame shape).
    ProtocolError(String),

    /// Serialization or deserialization failure.
    SerializationError(String),

    /// Socket or I/O error.
    IoError(String),

    /// The owning instance was disposed while the operation was pending.
    ///
    /// Pending sends, deliveries, and discoveries observe this when the
    /// client or server is closed before a matching reply arrives.
    Disposed,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Server already started"),
            Self::AlreadyConnecting => write!(f, "Client already connecting or connected"),
            Self::NameTaken(n) => write!(f, "Client name already taken: {n}"),
            Self::ReservedCommand(c) => write!(f, "Command name is reserved: {c}"),
            Self::DuplicateHandler(c) => write!(f, "Handler already registered: {c}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ProtocolError(e) => write!(f, "Protocol error: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::IoError(e) => write!(f, "I/O error: {e}"),
            Self::Disposed => write!(f, "Instance disposed"),
        }
    }
}

impl std::error::Error for IpcError {}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = IpcError::NameTaken("c1".to_string());
        assert_eq!(err.to_string(), "Client name already taken: c1");

        let err = IpcError::ReservedCommand("handshake".to_string());
        assert_eq!(err.to_string(), "Command name is reserved: handshake");

        let err = IpcError::Disposed;
        assert_eq!(err.to_string(), "Instance disposed");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: IpcError = io.into();
        assert!(matches!(err, IpcError::IoError(_)));
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: IpcError = serde_err.into();
        assert!(matches!(err, IpcError::SerializationError(_)));
    }
}
