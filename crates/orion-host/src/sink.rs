//! Byte-stream sinks for captured guest output
//!
//! The import table writes every `fd_write` payload to an [`OutputSink`]. The
//! runtime keeps no output of its own across runs: each run tees the
//! embedder's sink with a private [`MemorySink`] that becomes the run's
//! report and is sealed when the run ends.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Output stream a write is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Map a WASI file descriptor to an output stream.
    pub fn from_fd(fd: u32) -> Option<Self> {
        match fd {
            1 => Some(Stream::Stdout),
            2 => Some(Stream::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Destination for guest output.
///
/// Implementations must preserve call order per stream. Both methods are
/// invoked synchronously from inside a host call, so they must not block on
/// the guest.
pub trait OutputSink: Send + Sync {
    /// Append `bytes` to `stream`.
    fn write(&self, stream: Stream, bytes: &[u8]);

    /// Record the code passed to `proc_exit`.
    fn exit(&self, _code: i32) {}

    /// Called once when the run ends, after its last write.
    fn flush(&self) {}
}

/// Everything a run wrote, plus its exit code if it called `proc_exit`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

#[derive(Default)]
struct MemorySinkInner {
    output: CapturedOutput,
    sealed: bool,
}

/// In-memory sink. Appends until sealed, then ignores further writes.
#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<MemorySinkInner>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the sink already shared.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Copy of what has been captured so far.
    pub fn snapshot(&self) -> CapturedOutput {
        self.inner.lock().output.clone()
    }

    /// Freeze the capture and return it. Idempotent.
    pub fn seal(&self) -> CapturedOutput {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        inner.output.clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }
}

impl OutputSink for MemorySink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.sealed {
            warn!("Dropping {} bytes written to sealed {}", bytes.len(), stream);
            return;
        }
        match stream {
            Stream::Stdout => inner.output.stdout.extend_from_slice(bytes),
            Stream::Stderr => inner.output.stderr.extend_from_slice(bytes),
        }
    }

    fn exit(&self, code: i32) {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return;
        }
        // First exit wins; a run terminates on its first proc_exit.
        inner.output.exit_code.get_or_insert(code);
    }
}

/// Text callback invoked for each write
pub type OutputCallback = Arc<dyn Fn(Stream, &str) + Send + Sync>;

/// Length of a UTF-8 sequence cut off at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Sink that decodes writes as UTF-8 and hands the text to a callback.
///
/// A character split across two writes is held back until the rest of it
/// arrives. Whatever is still pending at [`OutputSink::flush`] is passed on
/// with replacement characters.
pub struct CallbackSink {
    callback: OutputCallback,
    pending: Mutex<HashMap<Stream, Vec<u8>>>,
}

impl CallbackSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Stream, &str) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, stream: Stream, bytes: &[u8]) {
        if !bytes.is_empty() {
            (self.callback)(stream, &String::from_utf8_lossy(bytes));
        }
    }
}

impl OutputSink for CallbackSink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        let ready = {
            let mut pending = self.pending.lock();
            let buf = pending.entry(stream).or_default();
            buf.extend_from_slice(bytes);
            let split = buf.len() - incomplete_tail(buf);
            let tail = buf.split_off(split);
            std::mem::replace(buf, tail)
        };
        self.emit(stream, &ready);
    }

    fn exit(&self, _code: i32) {
        self.flush();
    }

    fn flush(&self) {
        let drained: Vec<(Stream, Vec<u8>)> = self.pending.lock().drain().collect();
        for (stream, bytes) in drained {
            self.emit(stream, &bytes);
        }
    }
}

/// Forwards every write and exit to two sinks, primary first.
pub struct TeeSink {
    primary: Arc<dyn OutputSink>,
    secondary: Arc<dyn OutputSink>,
}

impl TeeSink {
    pub fn new(primary: Arc<dyn OutputSink>, secondary: Arc<dyn OutputSink>) -> Self {
        Self { primary, secondary }
    }
}

impl OutputSink for TeeSink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        self.primary.write(stream, bytes);
        self.secondary.write(stream, bytes);
    }

    fn exit(&self, code: i32) {
        self.primary.exit(code);
        self.secondary.exit(code);
    }

    fn flush(&self) {
        self.primary.flush();
        self.secondary.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_from_fd() {
        assert_eq!(Stream::from_fd(1), Some(Stream::Stdout));
        assert_eq!(Stream::from_fd(2), Some(Stream::Stderr));
        assert_eq!(Stream::from_fd(0), None);
        assert_eq!(Stream::from_fd(3), None);
    }

    #[test]
    fn test_memory_sink_appends_in_order() {
        let sink = MemorySink::new();
        sink.write(Stream::Stdout, b"hello");
        sink.write(Stream::Stderr, b"oops");
        sink.write(Stream::Stdout, b" world");

        let out = sink.snapshot();
        assert_eq!(out.stdout_string(), "hello world");
        assert_eq!(out.stderr_string(), "oops");
        assert_eq!(out.exit_code, None);
    }

    #[test]
    fn test_memory_sink_seal_freezes_output() {
        let sink = MemorySink::new();
        sink.write(Stream::Stdout, b"before");
        sink.exit(3);
        let sealed = sink.seal();

        sink.write(Stream::Stdout, b"after");
        sink.exit(9);

        assert!(sink.is_sealed());
        assert_eq!(sink.snapshot(), sealed);
        assert_eq!(sealed.stdout, b"before");
        assert_eq!(sealed.exit_code, Some(3));
    }

    #[test]
    fn test_memory_sink_keeps_first_exit_code() {
        let sink = MemorySink::new();
        sink.exit(1);
        sink.exit(2);
        assert_eq!(sink.snapshot().exit_code, Some(1));
    }

    #[test]
    fn test_callback_sink_decodes_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = CallbackSink::new(move |stream, text| {
            seen_clone.lock().push((stream, text.to_string()));
        });

        sink.write(Stream::Stdout, "héllo".as_bytes());
        sink.write(Stream::Stderr, &[0xff]);

        let seen = seen.lock();
        assert_eq!(seen[0], (Stream::Stdout, "héllo".to_string()));
        assert_eq!(seen[1], (Stream::Stderr, "\u{fffd}".to_string()));
    }

    #[test]
    fn test_callback_sink_joins_split_characters() {
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_clone = seen.clone();
        let sink = CallbackSink::new(move |_, text| seen_clone.lock().push_str(text));

        // "é" is C3 A9, "€" is E2 82 AC
        sink.write(Stream::Stdout, b"caf\xC3");
        assert_eq!(*seen.lock(), "caf");
        sink.write(Stream::Stdout, b"\xA9 \xE2\x82");
        sink.write(Stream::Stdout, b"\xAC");
        assert_eq!(*seen.lock(), "café €");
    }

    #[test]
    fn test_callback_sink_keeps_streams_apart() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = CallbackSink::new(move |stream, text| {
            seen_clone.lock().push((stream, text.to_string()));
        });

        sink.write(Stream::Stdout, b"\xC3");
        sink.write(Stream::Stderr, b"\xC3\xA9");
        sink.write(Stream::Stdout, b"\xA9");

        let seen = seen.lock();
        assert_eq!(seen[0], (Stream::Stderr, "é".to_string()));
        assert_eq!(seen[1], (Stream::Stdout, "é".to_string()));
    }

    #[test]
    fn test_callback_sink_flushes_dangling_bytes() {
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_clone = seen.clone();
        let sink = CallbackSink::new(move |_, text| seen_clone.lock().push_str(text));

        sink.write(Stream::Stdout, b"ok\xE2\x82");
        assert_eq!(*seen.lock(), "ok");
        sink.flush();
        assert_eq!(*seen.lock(), "ok\u{fffd}");
        sink.flush();
        assert_eq!(*seen.lock(), "ok\u{fffd}");
    }

    #[test]
    fn test_incomplete_tail() {
        assert_eq!(incomplete_tail(b""), 0);
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail("é".as_bytes()), 0);
        assert_eq!(incomplete_tail(b"a\xC3"), 1);
        assert_eq!(incomplete_tail(b"\xE2\x82"), 2);
        assert_eq!(incomplete_tail(b"\xF0\x9F\x98"), 3);
        assert_eq!(incomplete_tail(b"\xF0\x9F\x98\x80"), 0);
        assert_eq!(incomplete_tail(b"\xff"), 0);
    }

    #[test]
    fn test_tee_sink_fans_out() {
        let a = MemorySink::shared();
        let b = MemorySink::shared();
        let tee = TeeSink::new(a.clone(), b.clone());

        tee.write(Stream::Stdout, b"x");
        tee.exit(4);

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot().exit_code, Some(4));
    }
}
