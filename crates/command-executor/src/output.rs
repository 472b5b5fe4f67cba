//! Bounded output capture with live subscribers

use crate::event::{LogSource, OutputLine};
use async_channel::{Receiver, Sender, TrySendError};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Default number of lines retained per process
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// Longest line kept intact; longer output is split at this many bytes
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const SUBSCRIBER_QUEUE: usize = 256;

/// Ring buffer of the most recent output lines of one process.
///
/// Cloning is cheap; all clones share the same buffer. Live subscribers
/// get a bounded queue each, and a subscriber that falls behind loses
/// lines rather than stalling the drain task.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    subscribers: Vec<Sender<OutputLine>>,
    open_streams: usize,
    dropped: u64,
}

impl OutputBuffer {
    /// Create a buffer keeping at most `capacity` lines, fed by
    /// `streams` drain tasks.
    pub fn new(capacity: usize, streams: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                subscribers: Vec::new(),
                open_streams: streams,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned buffer still holds valid lines.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line, evicting the oldest one when full
    pub fn push(&self, line: OutputLine) {
        let mut inner = self.lock();
        let mut dropped = 0;
        inner.subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        inner.dropped += dropped;
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line);
    }

    /// Mark one producing stream as finished. When the last stream ends,
    /// subscriber channels are closed.
    pub fn close_stream(&self) {
        let mut inner = self.lock();
        inner.open_streams = inner.open_streams.saturating_sub(1);
        if inner.open_streams == 0 {
            inner.subscribers.clear();
        }
    }

    /// Whether every producing stream has reached EOF
    pub fn is_closed(&self) -> bool {
        self.lock().open_streams == 0
    }

    /// Copy of the retained lines, oldest first
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// The last `n` retained lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<OutputLine> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// Whether any retained line satisfies `pred`
    pub fn contains(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.lock().lines.iter().any(|l| pred(&l.line))
    }

    /// Number of lines lost by lagging subscribers
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Subscribe to future lines and atomically receive the current
    /// backlog, so no line falls between the two.
    ///
    /// The receiver is closed once all streams have ended.
    pub fn subscribe(&self) -> (Vec<OutputLine>, Receiver<OutputLine>) {
        let mut inner = self.lock();
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE);
        if inner.open_streams > 0 {
            inner.subscribers.push(tx);
        }
        (inner.lines.iter().cloned().collect(), rx)
    }
}

/// Read `stream` line by line into `buffer` until EOF.
///
/// Invalid UTF-8 is replaced rather than treated as an error, so the pipe
/// keeps being drained no matter what the child writes. A line reaching
/// [`MAX_LINE_BYTES`] without a newline is flushed as is.
pub(crate) async fn drain<R>(service: String, stream: R, source: LogSource, buffer: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        let (used, complete) = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => {
                let room = MAX_LINE_BYTES - line.len();
                let window = &chunk[..chunk.len().min(room)];
                match window.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        line.extend_from_slice(&window[..end]);
                        (end + 1, true)
                    }
                    None => {
                        line.extend_from_slice(window);
                        (window.len(), line.len() >= MAX_LINE_BYTES)
                    }
                }
            }
            Err(e) => {
                warn!(service = %service, ?source, error = %e, "Output drain failed");
                break;
            }
        };
        reader.consume(used);
        if complete {
            flush_line(&mut line, source, &buffer);
        }
    }
    if !line.is_empty() {
        flush_line(&mut line, source, &buffer);
    }
    debug!(service = %service, ?source, "Output stream closed");
    buffer.close_stream();
}

fn flush_line(line: &mut Vec<u8>, source: LogSource, buffer: &OutputBuffer) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    buffer.push(OutputLine::new(source, String::from_utf8_lossy(line)));
    line.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> OutputLine {
        OutputLine::new(LogSource::Stdout, text)
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let buffer = OutputBuffer::new(2, 1);
        buffer.push(line("a"));
        buffer.push(line("b"));
        buffer.push(line("c"));

        let lines: Vec<_> = buffer.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["b", "c"]);
        assert_eq!(buffer.tail(1)[0].line, "c");
    }

    #[test]
    fn test_lagging_subscriber_drops_instead_of_blocking() {
        let buffer = OutputBuffer::new(10, 1);
        let (_, rx) = buffer.subscribe();
        for i in 0..SUBSCRIBER_QUEUE + 5 {
            buffer.push(line(&i.to_string()));
        }
        assert_eq!(rx.len(), SUBSCRIBER_QUEUE);
        assert_eq!(buffer.dropped(), 5);
    }

    #[test]
    fn test_subscribers_close_after_last_stream() {
        let buffer = OutputBuffer::new(10, 2);
        buffer.push(line("ready"));
        let (backlog, rx) = buffer.subscribe();
        assert_eq!(backlog.len(), 1);

        buffer.close_stream();
        assert!(!rx.is_closed());
        buffer.close_stream();
        assert!(rx.is_closed());
        assert!(buffer.is_closed());
        assert!(buffer.contains(|l| l == "ready"));
    }

    #[smol_potat::test]
    async fn test_drain_splits_lines_and_strips_newlines() {
        let buffer = OutputBuffer::new(10, 1);
        let input: &[u8] = b"one\r\ntwo\n\xffthree";
        drain("svc".into(), input, LogSource::Stderr, buffer.clone()).await;

        let lines: Vec<_> = buffer.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["one", "two", "\u{fffd}three"]);
        assert!(buffer.is_closed());
    }

    #[smol_potat::test]
    async fn test_drain_splits_overlong_lines() {
        let buffer = OutputBuffer::new(10, 1);
        let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\nnext\n");
        drain("svc".into(), input.as_slice(), LogSource::Stdout, buffer.clone()).await;

        let lines: Vec<_> = buffer.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1], "x".repeat(10));
        assert_eq!(lines[2], "next");
    }
}
