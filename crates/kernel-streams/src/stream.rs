//! Stream traits and the default process streams.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::lock;

/// A byte sink shared across threads.
///
/// Methods take `&self` because one stream may be written from several
/// threads at once; implementations synchronize internally.
pub trait OutputStream: Send + Sync {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.flush()
    }

    /// Human-readable name, used for `Display` on delegating handles.
    fn describe(&self) -> String;
}

/// A byte source shared across threads.
pub trait InputStream: Send + Sync {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

pub type SharedOutput = Arc<dyn OutputStream>;
pub type SharedInput = Arc<dyn InputStream>;

/// The kernel process's real stdout.
#[derive(Debug, Default)]
pub struct ProcessStdout;

impl OutputStream for ProcessStdout {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        io::stdout().lock().write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        io::stdout().lock().flush()
    }

    fn describe(&self) -> String {
        "process stdout".to_string()
    }
}

/// The kernel process's real stderr.
#[derive(Debug, Default)]
pub struct ProcessStderr;

impl OutputStream for ProcessStderr {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        io::stderr().lock().write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().lock().flush()
    }

    fn describe(&self) -> String {
        "process stderr".to_string()
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct BufferOutput {
    name: String,
    bytes: Mutex<Vec<u8>>,
}

impl BufferOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl OutputStream for BufferOutput {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Input that is never available. The default stdin of a kernel: only an
/// execution that allows stdin installs something readable.
#[derive(Debug, Default)]
pub struct NoInput;

impl InputStream for NoInput {
    fn read_bytes(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stdin is not available to this execution",
        ))
    }

    fn describe(&self) -> String {
        "no input".to_string()
    }
}

/// Input served from a fixed string.
#[derive(Debug)]
pub struct TextInput {
    name: String,
    remaining: Mutex<VecDeque<u8>>,
}

impl TextInput {
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            remaining: Mutex::new(text.bytes().collect()),
        }
    }
}

impl InputStream for TextInput {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.remaining).read(buf)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
