//! Capturing output stream.
//!
//! Bytes written to a [`CapturingOutputStream`] pass through to an optional
//! ground-truth stream and are also collected into line-oriented chunks that
//! are handed to a callback. Chunks are emitted when enough complete lines
//! have accumulated, when the buffer grows too large, or when a periodic
//! timer fires.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::lock;
use crate::stream::{OutputStream, SharedOutput};

const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

/// Knobs controlling how output is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// When false, writes only reach the ground truth.
    pub capture_output: bool,
    /// Interval of the periodic flush.
    pub buffer_time_limit: Duration,
    /// Buffered size that forces a flush even without a newline.
    pub buffer_max_size: usize,
    /// Total bytes captured per stream before capture stops.
    pub per_execution_max_size: usize,
    /// Buffered size that triggers a flush once a complete line is pending.
    pub newline_buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_output: true,
            buffer_time_limit: Duration::from_millis(100),
            buffer_max_size: 1000,
            per_execution_max_size: 100_000,
            newline_buffer_size: 100,
        }
    }
}

/// Shared, runtime-mutable handle to a [`CaptureConfig`].
///
/// Every write reads the current values, so changes apply to the next write
/// of every stream holding a clone of the handle.
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    inner: Arc<RwLock<CaptureConfig>>,
}

impl OutputConfig {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn get(&self) -> CaptureConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, config: CaptureConfig) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn update(&self, f: impl FnOnce(&mut CaptureConfig)) {
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *config);
    }
}

/// Receives each captured chunk of text.
pub type CaptureCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct CaptureState {
    /// Complete lines not yet emitted.
    pending: Vec<u8>,
    /// Bytes after the last newline.
    incomplete: Vec<u8>,
    /// Bytes accepted into the buffers so far.
    captured: usize,
    truncated: bool,
    closed: bool,
    /// Chunks taken from the buffers but not yet handed to the callback.
    outbox: VecDeque<String>,
    /// Thread currently delivering the outbox.
    emitter: Option<ThreadId>,
}

impl CaptureState {
    fn buffered(&self) -> usize {
        self.pending.len() + self.incomplete.len()
    }

    /// Drain both buffers into text. Unless `lossy`, a trailing partial
    /// UTF-8 sequence stays behind in `incomplete`.
    fn take_text(&mut self, lossy: bool) -> Option<String> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.append(&mut self.incomplete);
        if !lossy {
            let keep = incomplete_utf8_tail(&bytes);
            self.incomplete = bytes.split_off(bytes.len() - keep);
        }
        if bytes.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn queue_buffers(&mut self, lossy: bool) {
        if let Some(text) = self.take_text(lossy) {
            self.outbox.push_back(text);
        }
    }
}

/// Length of a multi-byte UTF-8 sequence cut off at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

struct Inner {
    name: String,
    config: OutputConfig,
    ground_truth: Option<SharedOutput>,
    on_captured: CaptureCallback,
    state: Mutex<CaptureState>,
    /// Signalled whenever a thread stops delivering the outbox.
    delivered: Condvar,
}

/// Clears the emitter if a callback unwinds mid-delivery.
struct Delivering<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.inner.state).emitter = None;
            self.inner.delivered.notify_all();
        }
    }
}

impl Inner {
    /// Hand queued chunks to the callback with the state lock released.
    ///
    /// One thread delivers at a time, so chunks keep their order. Chunks
    /// queued by the delivering thread itself (a callback writing back into
    /// this stream) are picked up by its own loop. With `wait`, a caller on
    /// another thread blocks until the current delivery is finished.
    fn deliver(&self, mut state: MutexGuard<'_, CaptureState>, wait: bool) {
        let me = thread::current().id();
        let emitter = state.emitter;
        match emitter {
            Some(owner) if owner == me => return,
            Some(_) => {
                if wait {
                    while state.emitter.is_some() {
                        state = self
                            .delivered
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
                return;
            }
            None if state.outbox.is_empty() => return,
            None => state.emitter = Some(me),
        }
        drop(state);

        let mut delivering = Delivering {
            inner: self,
            armed: true,
        };
        loop {
            let mut state = lock(&self.state);
            match state.outbox.pop_front() {
                Some(text) => {
                    drop(state);
                    (self.on_captured)(&text);
                }
                None => {
                    state.emitter = None;
                    delivering.armed = false;
                    drop(state);
                    self.delivered.notify_all();
                    return;
                }
            }
        }
    }

    fn buffer(&self, buf: &[u8]) {
        let config = self.config.get();
        if !config.capture_output || buf.is_empty() {
            return;
        }

        let mut state = lock(&self.state);
        if state.closed || state.truncated {
            return;
        }

        let room = config.per_execution_max_size.saturating_sub(state.captured);
        let accepted = &buf[..buf.len().min(room)];
        state.captured += accepted.len();

        match accepted.iter().rposition(|b| *b == b'\n') {
            Some(idx) => {
                let mut completed = std::mem::take(&mut state.incomplete);
                completed.extend_from_slice(&accepted[..=idx]);
                state.pending.extend_from_slice(&completed);
                state.incomplete.extend_from_slice(&accepted[idx + 1..]);
            }
            None => state.incomplete.extend_from_slice(accepted),
        }

        if accepted.len() < buf.len() {
            state.truncated = true;
            state.queue_buffers(true);
            state.outbox.push_back(format!(
                "\n[output truncated: more than {} bytes]\n",
                config.per_execution_max_size
            ));
            debug!(
                "[capture] {} reached {} captured bytes, further output is not captured",
                self.name, config.per_execution_max_size
            );
            self.deliver(state, false);
            return;
        }

        let size = state.buffered();
        if (!state.pending.is_empty() && size >= config.newline_buffer_size)
            || size >= config.buffer_max_size
        {
            state.queue_buffers(false);
        }
        self.deliver(state, false);
    }

    fn flush_buffers(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.queue_buffers(false);
        }
        self.deliver(state, true);
    }
}

struct FlushTimer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    fn spawn(inner: Weak<Inner>, name: &str) -> io::Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || loop {
                let interval = match inner.upgrade() {
                    Some(inner) => inner.config.get().buffer_time_limit,
                    None => break,
                };
                match stop_rx.recv_timeout(interval.max(MIN_TIMER_INTERVAL)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match inner.upgrade() {
                    Some(inner) => inner.flush_buffers(),
                    None => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("[capture] flush timer panicked");
        }
    }
}

/// Output stream that tees into a ground truth and a capture callback.
pub struct CapturingOutputStream {
    inner: Arc<Inner>,
    timer: Mutex<Option<FlushTimer>>,
}

impl CapturingOutputStream {
    pub fn new(
        name: impl Into<String>,
        config: OutputConfig,
        ground_truth: Option<SharedOutput>,
        on_captured: CaptureCallback,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new(Inner {
            name: name.clone(),
            config,
            ground_truth,
            on_captured,
            state: Mutex::new(CaptureState::default()),
            delivered: Condvar::new(),
        });
        let timer = match FlushTimer::spawn(Arc::downgrade(&inner), &name) {
            Ok(timer) => Some(timer),
            Err(e) => {
                warn!("[capture] Failed to start flush timer for {name}: {e}");
                None
            }
        };
        Self {
            inner,
            timer: Mutex::new(timer),
        }
    }

    /// Bytes accepted for capture so far.
    pub fn captured_bytes(&self) -> usize {
        lock(&self.inner.state).captured
    }

    pub fn is_truncated(&self) -> bool {
        lock(&self.inner.state).truncated
    }

    fn stop_timer(&self) {
        let timer = lock(&self.timer).take();
        if let Some(timer) = timer {
            timer.stop();
        }
    }
}

impl OutputStream for CapturingOutputStream {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        if let Some(ground_truth) = &self.inner.ground_truth {
            if let Err(e) = ground_truth.write_bytes(buf) {
                warn!(
                    "[capture] Write to {} failed: {e}",
                    ground_truth.describe()
                );
            }
        }
        self.inner.buffer(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush_buffers();
        match &self.inner.ground_truth {
            Some(ground_truth) => ground_truth.flush(),
            None => Ok(()),
        }
    }

    /// Emits everything still buffered and stops the timer. The ground truth
    /// stays open.
    fn close(&self) -> io::Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if !state.closed {
                state.queue_buffers(true);
                state.closed = true;
            }
            self.inner.deliver(state, true);
        }
        self.stop_timer();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("capturing {}", self.inner.name)
    }
}

impl Drop for CapturingOutputStream {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferOutput;
    use std::sync::OnceLock;

    fn collector() -> (CaptureCallback, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let callback: CaptureCallback = Arc::new(move |text: &str| {
            sink.lock().unwrap().push(text.to_string());
        });
        (callback, chunks)
    }

    fn slow_config() -> CaptureConfig {
        CaptureConfig {
            buffer_time_limit: Duration::from_secs(3600),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn test_partial_line_waits_for_flush() {
        let (callback, chunks) = collector();
        let stream =
            CapturingOutputStream::new("stdout", OutputConfig::new(slow_config()), None, callback);

        stream.write_bytes(b"no newline here").unwrap();
        assert!(chunks.lock().unwrap().is_empty());

        stream.flush().unwrap();
        stream.flush().unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec!["no newline here"]);
    }

    #[test]
    fn test_newline_threshold() {
        let (callback, chunks) = collector();
        let config = CaptureConfig {
            newline_buffer_size: 10,
            ..slow_config()
        };
        let stream =
            CapturingOutputStream::new("stdout", OutputConfig::new(config), None, callback);

        stream.write_bytes(b"abc\n").unwrap();
        assert!(chunks.lock().unwrap().is_empty());
        stream.write_bytes(b"defghij\nk").unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec!["abc\ndefghij\nk"]);
    }

    #[test]
    fn test_max_size_without_newline() {
        let (callback, chunks) = collector();
        let config = CaptureConfig {
            buffer_max_size: 8,
            ..slow_config()
        };
        let stream =
            CapturingOutputStream::new("stdout", OutputConfig::new(config), None, callback);

        stream.write_bytes(b"1234").unwrap();
        assert!(chunks.lock().unwrap().is_empty());
        stream.write_bytes(b"5678").unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec!["12345678"]);
    }

    #[test]
    fn test_split_utf8_is_held_back() {
        let (callback, chunks) = collector();
        let stream =
            CapturingOutputStream::new("stdout", OutputConfig::new(slow_config()), None, callback);

        let snowman = "\u{2603}".as_bytes();
        stream.write_bytes(b"a").unwrap();
        stream.write_bytes(&snowman[..1]).unwrap();
        stream.flush().unwrap();
        stream.write_bytes(&snowman[1..]).unwrap();
        stream.flush().unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec!["a", "\u{2603}"]);
    }

    #[test]
    fn test_cap_stops_capture_but_not_ground_truth() {
        let (callback, chunks) = collector();
        let ground_truth = Arc::new(BufferOutput::new("real"));
        let config = CaptureConfig {
            per_execution_max_size: 10,
            ..slow_config()
        };
        let stream = CapturingOutputStream::new(
            "stdout",
            OutputConfig::new(config),
            Some(ground_truth.clone()),
            callback,
        );

        stream.write_bytes(b"0123456789abcdef").unwrap();
        stream.write_bytes(b"more").unwrap();
        stream.close().unwrap();

        assert_eq!(ground_truth.text(), "0123456789abcdefmore");
        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks[0], "0123456789");
        assert!(chunks[1].contains("truncated"));
        assert_eq!(chunks.len(), 2);
        assert!(stream.is_truncated());
        assert_eq!(stream.captured_bytes(), 10);
    }

    #[test]
    fn test_capture_disabled_at_runtime() {
        let (callback, chunks) = collector();
        let config = OutputConfig::new(slow_config());
        let stream = CapturingOutputStream::new("stdout", config.clone(), None, callback);

        config.update(|c| c.capture_output = false);
        stream.write_bytes(b"invisible\n").unwrap();
        config.update(|c| c.capture_output = true);
        stream.write_bytes(b"visible").unwrap();
        stream.close().unwrap();

        assert_eq!(*chunks.lock().unwrap(), vec!["visible"]);
    }

    #[test]
    fn test_timer_flushes() {
        let (callback, chunks) = collector();
        let config = CaptureConfig {
            buffer_time_limit: Duration::from_millis(10),
            ..CaptureConfig::default()
        };
        let stream =
            CapturingOutputStream::new("stdout", OutputConfig::new(config), None, callback);
        stream.write_bytes(b"tick").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while chunks.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*chunks.lock().unwrap(), vec!["tick"]);
        stream.close().unwrap();
    }

    #[test]
    fn test_close_does_not_close_ground_truth() {
        let (callback, _chunks) = collector();
        let ground_truth = Arc::new(BufferOutput::new("real"));
        let stream = CapturingOutputStream::new(
            "stdout",
            OutputConfig::default(),
            Some(ground_truth.clone()),
            callback,
        );
        stream.close().unwrap();
        stream.write_bytes(b"after").unwrap();
        assert_eq!(ground_truth.text(), "after");
    }

    #[test]
    fn test_callback_may_write_back_into_stream() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<OnceLock<Arc<CapturingOutputStream>>> = Arc::new(OnceLock::new());
        let callback: CaptureCallback = {
            let chunks = chunks.clone();
            let slot = slot.clone();
            Arc::new(move |text: &str| {
                chunks.lock().unwrap().push(text.to_string());
                if !text.starts_with("log:") {
                    if let Some(stream) = slot.get() {
                        let line = format!("log: {} bytes\n", text.len());
                        stream.write_bytes(line.as_bytes()).unwrap();
                    }
                }
            })
        };
        let config = CaptureConfig {
            newline_buffer_size: 1,
            ..slow_config()
        };
        let stream = Arc::new(CapturingOutputStream::new(
            "stderr",
            OutputConfig::new(config),
            None,
            callback,
        ));
        assert!(slot.set(stream.clone()).is_ok());

        let writer = {
            let stream = stream.clone();
            thread::spawn(move || {
                stream.write_bytes(b"hello\n").unwrap();
                stream.flush().unwrap();
            })
        };
        writer.join().unwrap();
        stream.close().unwrap();

        assert_eq!(*chunks.lock().unwrap(), vec!["hello\n", "log: 6 bytes\n"]);
    }

    #[test]
    fn test_concurrent_flush_waits_for_delivery() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let callback: CaptureCallback = {
            let delivered = delivered.clone();
            Arc::new(move |text: &str| {
                if text == "first\n" {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                delivered.lock().unwrap().push(text.to_string());
            })
        };
        let config = CaptureConfig {
            newline_buffer_size: 1,
            ..slow_config()
        };
        let stream = Arc::new(CapturingOutputStream::new(
            "stdout",
            OutputConfig::new(config),
            None,
            callback,
        ));

        let first = {
            let stream = stream.clone();
            thread::spawn(move || stream.write_bytes(b"first\n").unwrap())
        };
        entered_rx.recv().unwrap();

        // Queued behind the delivery in progress; flush returns once both are out.
        stream.write_bytes(b"second").unwrap();
        let flusher = {
            let stream = stream.clone();
            thread::spawn(move || stream.flush().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!flusher.is_finished());

        release_tx.send(()).unwrap();
        first.join().unwrap();
        flusher.join().unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec!["first\n", "second"]);
        stream.close().unwrap();
    }

    #[test]
    fn test_incomplete_tail_width() {
        assert_eq!(incomplete_utf8_tail(b"abc"), 0);
        assert_eq!(incomplete_utf8_tail(&[b'a', 0xE2]), 1);
        assert_eq!(incomplete_utf8_tail(&[b'a', 0xE2, 0x98]), 2);
        assert_eq!(incomplete_utf8_tail(&[0xE2, 0x98, 0x83]), 0);
        assert_eq!(incomplete_utf8_tail(&[0xF0, 0x9F, 0x98]), 3);
    }
}
