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

//! Framed JSON message codec with stream reassembly.
//!
//! # Wire Format
//!
//! One JSON object per logical frame, concatenated back-to-back with no
//! separator other than the adjacent braces:
//!
//! ```text
//! {"id":null,"command":"ping","data":{"x":1},"delivery":null}{"id":...}
//! ```
//!
//! [`parse`] recovers every whole frame that accumulated in a single stream
//! read; [`FrameDecoder`] buffers partial trailing bytes across reads until
//! the outer braces balance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::IpcError;

/// Error data code: message not parseable as JSON.
pub const ERR_NOT_JSON: i64 = 101;

/// Error data code: message parsed but not a JSON array of frames.
pub const ERR_NOT_ARRAY: i64 = 102;

/// Error data code: client name already taken on this domain.
pub const ERR_NAME_TAKEN: i64 = 201;

/// Read buffer size for the stream reassembly helper.
const READ_CHUNK_SIZE: usize = 4096;

/// One logical message on the wire.
///
/// All four fields are always present in the serialized form, with `null`
/// standing in for absent values.
///
/// - `id`: for handshake replies the target client's friendly name, for
///   relay envelopes the originator's friendly name, otherwise null.
/// - `command`: application command name or one of the reserved names.
/// - `data`: any JSON value; for relay control messages this carries an
///   inner serialized frame.
/// - `delivery`: opaque correlation id (hex UUID, no dashes) requesting a
///   reply and matching a later reply frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Frame {
    /// Friendly-name slot (target for handshake replies, originator for
    /// relay envelopes).
    #[serde(default)]
    pub id: Option<String>,

    /// Command name.
    #[serde(default)]
    pub command: Option<String>,

    /// Application payload, preserved as any JSON value.
    #[serde(default)]
    pub data: Value,

    /// Correlation id for request-response delivery.
    #[serde(default)]
    pub delivery: Option<String>,
}

impl Frame {
    /// Creates a frame with every field defaulted to null.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: None,
            command: None,
            data: Value::Null,
            delivery: None,
        }
    }

    /// Creates a bare `{command, data}` frame.
    #[must_use]
    pub fn command(command: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            command: Some(command.into()),
            data,
            delivery: None,
        }
    }

    /// Creates an addressed `{id, command, data}` frame.
    #[must_use]
    pub fn addressed(id: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            command: Some(command.into()),
            data,
            delivery: None,
        }
    }

    /// Returns a copy of this frame with the delivery correlation id set.
    #[must_use]
    pub fn with_delivery(mut self, delivery: impl Into<String>) -> Self {
        self.delivery = Some(delivery.into());
        self
    }

    /// Creates the synthetic `error` frame carrying a wire error data code.
    #[must_use]
    pub fn error(code: i64) -> Self {
        Self::command("error", Value::from(code))
    }
}

/// Serialize a frame to wire bytes: one JSON object, explicit nulls.
///
/// # Errors
///
/// Returns [`IpcError::SerializationError`] if JSON serialization fails.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, IpcError> {
    serde_json::to_vec(frame).map_err(IpcError::from)
}

/// Serialize a frame to a JSON string.
///
/// Used for the inner frame of relay envelopes, which travels as a string
/// inside the outer frame's `data`.
///
/// # Errors
///
/// Returns [`IpcError::SerializationError`] if JSON serialization fails.
pub fn encode_string(frame: &Frame) -> Result<String, IpcError> {
    serde_json::to_string(frame).map_err(IpcError::from)
}

/// Decode every whole frame contained in one chunk of wire bytes.
///
/// Strips all CR/LF characters, splices the `}{` junctions between
/// adjacent frames into `},{`, wraps the result in `[`..`]` and parses it
/// as a JSON array. The splice is applied only at top-level value
/// boundaries (a string- and escape-aware scan), so `}{` inside a payload
/// string passes through intact. Parse failure yields a single synthetic
/// frame `{command:"error", data:101}`; a parsed non-array yields
/// `{command:"error", data:102}`. Object elements are normalized to the
/// four frame fields with missing values set to null; non-object elements
/// become `{data: element}`.
#[must_use]
pub fn parse(input: &str) -> Vec<Frame> {
    let spliced = splice_junctions(input);
    let wrapped = format!("[{spliced}]");

    let Ok(value) = serde_json::from_str::<Value>(&wrapped) else {
        return vec![Frame::error(ERR_NOT_JSON)];
    };
    let Value::Array(items) = value else {
        return vec![Frame::error(ERR_NOT_ARRAY)];
    };

    items.into_iter().map(normalize).collect()
}

/// Drop CR/LF and insert a comma wherever one top-level value ends and the
/// next begins.
fn splice_junctions(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    let mut need_comma = false;

    for c in input.chars() {
        if c == '\r' || c == '\n' {
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if need_comma && !c.is_ascii_whitespace() {
            out.push(',');
            need_comma = false;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    need_comma = true;
                }
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Normalize one parsed JSON value into a frame.
fn normalize(value: Value) -> Frame {
    let Value::Object(mut map) = value else {
        return Frame {
            id: None,
            command: None,
            data: value,
            delivery: None,
        };
    };

    Frame {
        id: string_field(map.remove("id")),
        command: string_field(map.remove("command")),
        data: map.remove("data").unwrap_or(Value::Null),
        delivery: string_field(map.remove("delivery")),
    }
}

/// Coerce a frame field to its string form; null and absent stay `None`.
fn string_field(value: Option<Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    }
}

/// Recover the inner frame carried by a relay envelope's `data`.
///
/// Envelopes encode the inner frame as a serialized JSON string; an
/// already-parsed object is accepted as well. Anything else yields `None`.
#[must_use]
pub fn parse_inner(data: &Value) -> Option<Frame> {
    match data {
        Value::String(s) => parse(s).into_iter().next(),
        Value::Object(_) => Some(normalize(data.clone())),
        _ => None,
    }
}

/// Incremental stream reassembly for concatenated JSON frames.
///
/// Bytes are buffered until the outer braces of at least one frame balance;
/// [`FrameDecoder::drain`] then decodes the complete prefix via [`parse`]
/// and retains any partial tail for the next read. The brace scan is
/// string- and escape-aware so payload text containing braces cannot split
/// a frame early.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Next unscanned byte offset into `buf`.
    scan: usize,
    /// End offset of the last byte that completed a top-level value.
    boundary: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes received from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode every whole frame currently buffered.
    ///
    /// Returns an empty vector when no frame has completed yet; partial
    /// trailing bytes stay buffered.
    pub fn drain(&mut self) -> Vec<Frame> {
        self.scan_boundary();
        if self.boundary == 0 {
            return Vec::new();
        }

        let complete: Vec<u8> = self.buf.drain(..self.boundary).collect();
        self.scan -= self.boundary;
        self.boundary = 0;

        match std::str::from_utf8(&complete) {
            Ok(text) => parse(text),
            Err(_) => vec![Frame::error(ERR_NOT_JSON)],
        }
    }

    /// Advance the brace-balance scan and record the last frame boundary.
    fn scan_boundary(&mut self) {
        for idx in self.scan..self.buf.len() {
            let b = self.buf[idx];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        self.boundary = idx + 1;
                    }
                }
                // Bytes outside any value cannot start a frame; consume
                // them so `parse` can surface the NOT_JSON error frame.
                _ if self.depth == 0 && !b.is_ascii_whitespace() => {
                    self.boundary = idx + 1;
                }
                _ => {}
            }
        }
        self.scan = self.buf.len();
    }
}

/// Read from the stream until at least one whole frame is available.
///
/// # Errors
///
/// Returns [`IpcError::ConnectionClosed`] on EOF and
/// [`IpcError::IoError`] on read failure.
pub(crate) async fn read_frames<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Vec<Frame>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        decoder.extend(&chunk[..n]);
        let frames = decoder.drain();
        if !frames.is_empty() {
            return Ok(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_explicit_nulls() {
        let frame = Frame::command("handshake", json!("c1"));
        let bytes = encode(&frame).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"id":null,"command":"handshake","data":"c1","delivery":null}"#
        );
    }

    #[test]
    fn test_parse_single_frame() {
        let frames = parse(r#"{"id":"c1","command":"handshake","data":"abc","delivery":null}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("c1"));
        assert_eq!(frames[0].command.as_deref(), Some("handshake"));
        assert_eq!(frames[0].data, json!("abc"));
        assert!(frames[0].delivery.is_none());
    }

    #[test]
    fn test_parse_concatenated_frames() {
        let frames = parse(r#"{"command":"a","data":1}{"command":"b","data":2}{"command":"c"}"#);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command.as_deref(), Some("a"));
        assert_eq!(frames[1].data, json!(2));
        assert_eq!(frames[2].data, Value::Null);
    }

    #[test]
    fn test_parse_strips_cr_lf() {
        let frames = parse("{\"command\":\"a\",\r\n\"data\":1}\n{\"command\":\"b\"}\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, json!(1));
    }

    #[test]
    fn test_parse_not_json() {
        let frames = parse("definitely not json");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command.as_deref(), Some("error"));
        assert_eq!(frames[0].data, json!(ERR_NOT_JSON));
    }

    #[test]
    fn test_parse_non_object_element() {
        let frames = parse("42");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].command.is_none());
        assert_eq!(frames[0].data, json!(42));
    }

    #[test]
    fn test_parse_coerces_scalar_fields() {
        let frames = parse(r#"{"id":7,"command":true,"data":null}"#);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].command.as_deref(), Some("true"));
    }

    #[test]
    fn test_round_trip_preserves_data_values() {
        for data in [
            json!({"nested": {"deep": [1, 2, 3]}}),
            json!([1, "two", null]),
            json!(3.25),
            json!("adjacent braces }{ in a string"),
            Value::Null,
        ] {
            let frame = Frame::addressed("c1", "cmd", data.clone()).with_delivery("d1");
            let decoded = parse(std::str::from_utf8(&encode(&frame).unwrap()).unwrap());
            assert_eq!(decoded, vec![frame]);
        }
    }

    #[test]
    fn test_parse_inner_string_and_object() {
        let inner = Frame::addressed("c2", "echo", json!("hi"));
        let wrapped = Value::String(encode_string(&inner).unwrap());
        assert_eq!(parse_inner(&wrapped), Some(inner.clone()));

        let object = serde_json::to_value(&inner).unwrap();
        assert_eq!(parse_inner(&object), Some(inner));

        assert_eq!(parse_inner(&json!(5)), None);
    }

    #[test]
    fn test_decoder_partial_then_complete() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(br#"{"command":"a","data":{"x""#);
        assert!(decoder.drain().is_empty());

        decoder.extend(br#":1}}{"command":"b"}"#);
        let frames = decoder.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, json!({"x": 1}));
        assert_eq!(frames[1].command.as_deref(), Some("b"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_arbitrary_split_points() {
        let wire = concat!(
            r#"{"id":null,"command":"one","data":{"s":"braces }{ inside"},"delivery":null}"#,
            r#"{"id":"c","command":"two","data":[1,{"k":"}"}],"delivery":"ff"}"#,
            r#"{"id":null,"command":"three","data":7,"delivery":null}"#
        )
        .as_bytes();

        for split_at in 1..wire.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            decoder.extend(&wire[..split_at]);
            frames.extend(decoder.drain());
            decoder.extend(&wire[split_at..]);
            frames.extend(decoder.drain());

            assert_eq!(frames.len(), 3, "split at {split_at}");
            assert_eq!(frames[0].command.as_deref(), Some("one"));
            assert_eq!(frames[0].data, json!({"s": "braces }{ inside"}));
            assert_eq!(frames[1].delivery.as_deref(), Some("ff"));
            assert_eq!(frames[2].data, json!(7));
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_decoder_escaped_quote_in_string() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(br#"{"command":"a","data":"quote \" and brace }"}"#);
        let frames = decoder.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, json!("quote \" and brace }"));
    }

    #[test]
    fn test_decoder_retains_trailing_partial() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(br#"{"command":"a"}{"command":"#);
        let frames = decoder.drain();
        assert_eq!(frames.len(), 1);
        assert!(decoder.pending() > 0);

        decoder.extend(br#""b"}"#);
        let frames = decoder.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_read_frames_across_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = client;
        let mut decoder = FrameDecoder::new();

        let handle = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(br#"{"command":"#).await.unwrap();
            server.write_all(br#""ping","data":1}"#).await.unwrap();
        });

        let frames = read_frames(&mut reader, &mut decoder).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command.as_deref(), Some("ping"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frames_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = client;
        let mut decoder = FrameDecoder::new();

        let result = read_frames(&mut reader, &mut decoder).await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }
}
