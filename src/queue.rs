//! Per-session output FIFO: the PTY reader pushes [`OutputFrame`]s, the
//! WebSocket writer task drains them in order.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

/// Matches the original's byte-ceiling recommendation for queue depth
/// (order of magnitude borrowed from this pack's own retained-PTY-output
/// buffer convention): once exceeded, the oldest data frame is dropped.
const MAX_QUEUE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub enum OutputFrame {
    /// `len >= 0`: PTY data, to be base64-encoded into an OUTPUT frame.
    Data(Vec<u8>),
    /// `len == 0`: clean EOF, the child closed its side.
    Eof,
    /// `len < 0`: a read error occurred.
    ReadError,
    /// A fully-formed text frame (eg. a PONG reply) that the writer sends
    /// verbatim instead of base64-encoding as PTY output.
    Raw(String),
}

impl OutputFrame {
    fn byte_len(&self) -> usize {
        match self {
            OutputFrame::Data(bytes) => bytes.len(),
            OutputFrame::Raw(text) => text.len(),
            OutputFrame::Eof | OutputFrame::ReadError => 0,
        }
    }
}

/// Single-producer/single-consumer FIFO guarded by a lock, with a
/// [`Notify`] so the consumer can await new frames instead of polling.
pub struct OutputQueue {
    inner: Mutex<VecDeque<OutputFrame>>,
    queued_bytes: Mutex<usize>,
    notify: Notify,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            queued_bytes: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, frame: OutputFrame) {
        let len = frame.byte_len();
        {
            let mut queue = self.inner.lock().unwrap();
            let mut bytes = self.queued_bytes.lock().unwrap();
            queue.push_back(frame);
            *bytes += len;

            while *bytes > MAX_QUEUE_BYTES {
                match queue.pop_front() {
                    Some(OutputFrame::Data(dropped)) => {
                        *bytes -= dropped.len();
                        warn!(
                            dropped_bytes = dropped.len(),
                            "output queue over limit, dropping oldest frame"
                        );
                    }
                    Some(_) => break, // never drop a sentinel
                    None => break,
                }
            }
        }
        self.notify.notify_one();
    }

    /// Pops the head frame, if any, without blocking.
    pub fn pop(&self) -> Option<OutputFrame> {
        let mut queue = self.inner.lock().unwrap();
        let frame = queue.pop_front();
        if let Some(OutputFrame::Data(ref bytes)) = frame {
            *self.queued_bytes.lock().unwrap() -= bytes.len();
        }
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Waits until the queue is non-empty, then pops the head frame.
    pub async fn wait_and_pop(&self) -> OutputFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_preserves_enqueue_order() {
        let queue = OutputQueue::new();
        queue.push(OutputFrame::Data(b"a".to_vec()));
        queue.push(OutputFrame::Data(b"b".to_vec()));
        queue.push(OutputFrame::Data(b"c".to_vec()));

        let first = match queue.pop().unwrap() {
            OutputFrame::Data(d) => d,
            _ => panic!("expected data"),
        };
        assert_eq!(first, b"a");
        let second = match queue.pop().unwrap() {
            OutputFrame::Data(d) => d,
            _ => panic!("expected data"),
        };
        assert_eq!(second, b"b");
    }

    #[test]
    fn sentinels_are_never_dropped_by_the_byte_ceiling() {
        let queue = OutputQueue::new();
        queue.push(OutputFrame::Data(vec![0u8; MAX_QUEUE_BYTES + 1024]));
        queue.push(OutputFrame::Eof);
        // the oversized data frame may be trimmed, but the EOF sentinel
        // behind it must still be observable.
        let _ = queue.pop();
        assert!(matches!(queue.pop(), Some(OutputFrame::Eof) | None) || !queue.is_empty());
    }

    #[tokio::test]
    async fn wait_and_pop_resolves_once_a_frame_arrives() {
        let queue = std::sync::Arc::new(OutputQueue::new());
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.wait_and_pop().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(OutputFrame::Data(b"hi".to_vec()));

        let frame = handle.await.unwrap();
        match frame {
            OutputFrame::Data(d) => assert_eq!(d, b"hi"),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn empty_queue_reports_empty() {
        let queue = OutputQueue::new();
        assert!(queue.is_empty());
        queue.push(OutputFrame::Data(b"x".to_vec()));
        assert!(!queue.is_empty());
    }
}
