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

//! Per-socket FIFO send queues.
//!
//! A [`SendQueue`] buffers encoded frames while its socket is unavailable
//! and drains them in order once a connection epoch begins. Each entry may
//! carry a completion signal that fires after the frame has been fully
//! written, so completion order always matches enqueue order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::IpcError;

/// One pending frame with its optional write-completion signal.
struct QueueEntry {
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<()>>,
}

/// Unbounded FIFO of encoded frames awaiting a writable socket.
///
/// The queue itself is connection-agnostic: it survives disconnects, and a
/// new connection epoch resumes draining from the head. At most one write
/// is in flight at a time; an entry is popped (and its completion fired)
/// only after the write is acknowledged, so a drain interrupted mid-write
/// redelivers the head frame on the next epoch.
#[derive(Default)]
pub struct SendQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl SendQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an encoded frame, with an optional completion signal fired
    /// once the frame has been fully written.
    pub fn push(&self, bytes: Vec<u8>, done: Option<oneshot::Sender<()>>) {
        self.entries.lock().push_back(QueueEntry { bytes, done });
        self.notify.notify_one();
    }

    /// Number of frames waiting to be written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Discards all pending entries.
    ///
    /// Dropping an entry drops its completion signal, so awaiting callers
    /// observe disposal rather than hanging.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Write queued frames to `writer` in FIFO order until cancelled or the
    /// writer fails.
    ///
    /// The head entry is popped only after `write_all` + `flush` succeed;
    /// on failure it stays queued for the next connection epoch and the
    /// error is returned so the caller can tear the epoch down.
    pub(crate) async fn drain_loop<W>(
        &self,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<(), IpcError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let head = self.entries.lock().front().map(|e| e.bytes.clone());
            match head {
                Some(bytes) => {
                    writer
                        .write_all(&bytes)
                        .await
                        .map_err(|e| IpcError::IoError(e.to_string()))?;
                    writer
                        .flush()
                        .await
                        .map_err(|e| IpcError::IoError(e.to_string()))?;

                    // Write acknowledged: pop and signal completion.
                    let done = self
                        .entries
                        .lock()
                        .pop_front()
                        .and_then(|mut entry| entry.done.take());
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(n: u8) -> Vec<u8> {
        format!("{{\"data\":{n}}}").into_bytes()
    }

    #[test]
    fn test_push_and_len() {
        let queue = SendQueue::new();
        assert!(queue.is_empty());

        queue.push(encoded(1), None);
        queue.push(encoded(2), None);
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_writes_in_fifo_order() {
        let queue = SendQueue::new();
        let cancel = CancellationToken::new();

        let mut signals = Vec::new();
        for n in 1..=3 {
            let (tx, rx) = oneshot::channel();
            queue.push(encoded(n), Some(tx));
            signals.push(rx);
        }

        let mut sink = Vec::new();
        let drain_cancel = cancel.clone();
        // Cancel once the queue is empty so the drain loop returns.
        tokio::spawn({
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                drain_cancel.cancel();
            }
        });
        queue.drain_loop(&mut sink, &cancel).await.unwrap();

        assert_eq!(
            String::from_utf8(sink).unwrap(),
            r#"{"data":1}{"data":2}{"data":3}"#
        );
        // Completion signals fire in enqueue order.
        for rx in signals {
            rx.await.unwrap();
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_halts_on_write_failure_and_keeps_head() {
        struct FailingWriter;
        impl AsyncWrite for FailingWriter {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "down",
                )))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let queue = SendQueue::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();
        queue.push(encoded(1), Some(tx));

        let mut writer = FailingWriter;
        let result = queue.drain_loop(&mut writer, &cancel).await;
        assert!(matches!(result, Err(IpcError::IoError(_))));

        // Entry stays queued with its completion signal intact.
        assert_eq!(queue.len(), 1);
        assert!(rx.try_recv().is_err());

        // A later epoch with a healthy writer delivers it.
        let mut sink = Vec::new();
        cancel.cancel();
        queue.drain_loop(&mut sink, &cancel).await.unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), r#"{"data":1}"#);
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_picks_up_frames_pushed_while_waiting() {
        let queue = std::sync::Arc::new(SendQueue::new());
        let cancel = CancellationToken::new();

        let pusher = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                queue.push(encoded(7), None);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let mut sink = Vec::new();
        queue.drain_loop(&mut sink, &cancel).await.unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), r#"{"data":7}"#);
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_drops_completion_signals() {
        let queue = SendQueue::new();
        let (tx, rx) = oneshot::channel();
        queue.push(encoded(1), Some(tx));

        queue.clear();
        assert!(rx.await.is_err());
    }
}
