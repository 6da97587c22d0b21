//! Stream handles that resolve their target on every operation.
//!
//! A handle is created once and given to an execution engine; it keeps
//! observing substitutions installed after it was handed out.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Arc;

use crate::stream::{InputStream, OutputStream, SharedInput, SharedOutput};

type OutputResolver = Arc<dyn Fn() -> SharedOutput + Send + Sync>;
type InputResolver = Arc<dyn Fn() -> SharedInput + Send + Sync>;

fn thin<T: ?Sized>(arc: &Arc<T>) -> *const () {
    Arc::as_ptr(arc) as *const ()
}

#[derive(Clone)]
pub struct DelegatingWriter {
    resolver: OutputResolver,
}

impl DelegatingWriter {
    pub fn new(resolver: impl Fn() -> SharedOutput + Send + Sync + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// The stream this handle would write to right now.
    pub fn target(&self) -> SharedOutput {
        (self.resolver)()
    }
}

impl OutputStream for DelegatingWriter {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        self.target().write_bytes(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.target().flush()
    }

    fn close(&self) -> io::Result<()> {
        self.target().close()
    }

    fn describe(&self) -> String {
        self.target().describe()
    }
}

impl io::Write for DelegatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputStream::flush(self)
    }
}

impl io::Write for &DelegatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputStream::flush(*self)
    }
}

/// Two handles are equal when they currently resolve to the same stream.
impl PartialEq for DelegatingWriter {
    fn eq(&self, other: &Self) -> bool {
        thin(&self.target()) == thin(&other.target())
    }
}

impl Hash for DelegatingWriter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin(&self.target()).hash(state);
    }
}

impl fmt::Display for DelegatingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for DelegatingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DelegatingWriter")
            .field(&self.describe())
            .finish()
    }
}

#[derive(Clone)]
pub struct DelegatingReader {
    resolver: InputResolver,
}

impl DelegatingReader {
    pub fn new(resolver: impl Fn() -> SharedInput + Send + Sync + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    pub fn target(&self) -> SharedInput {
        (self.resolver)()
    }
}

impl InputStream for DelegatingReader {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.target().read_bytes(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.target().close()
    }

    fn describe(&self) -> String {
        self.target().describe()
    }
}

impl io::Read for DelegatingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf)
    }
}

impl io::Read for &DelegatingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf)
    }
}

impl PartialEq for DelegatingReader {
    fn eq(&self, other: &Self) -> bool {
        thin(&self.target()) == thin(&other.target())
    }
}

impl Hash for DelegatingReader {
    fn hash<H: Hasher>(&self, state: &mut H) {
        thin(&self.target()).hash(state);
    }
}

impl fmt::Display for DelegatingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for DelegatingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DelegatingReader")
            .field(&self.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BufferOutput, TextInput};
    use std::io::{Read, Write};
    use std::sync::Mutex;

    #[test]
    fn test_writer_follows_resolver() {
        let a = Arc::new(BufferOutput::new("a"));
        let b = Arc::new(BufferOutput::new("b"));
        let slot: Arc<Mutex<SharedOutput>> = Arc::new(Mutex::new(a.clone()));

        let resolver_slot = slot.clone();
        let mut handle = DelegatingWriter::new(move || resolver_slot.lock().unwrap().clone());

        write!(handle, "one ").unwrap();
        assert_eq!(handle.to_string(), "a");
        *slot.lock().unwrap() = b.clone();
        write!(handle, "two").unwrap();
        assert_eq!(handle.to_string(), "b");

        assert_eq!(a.text(), "one ");
        assert_eq!(b.text(), "two");
    }

    #[test]
    fn test_equality_is_resolved_per_call() {
        let a: SharedOutput = Arc::new(BufferOutput::new("a"));
        let b: SharedOutput = Arc::new(BufferOutput::new("b"));
        let slot = Arc::new(Mutex::new(a.clone()));

        let s1 = slot.clone();
        let first = DelegatingWriter::new(move || s1.lock().unwrap().clone());
        let fixed_a = a.clone();
        let second = DelegatingWriter::new(move || fixed_a.clone());

        assert_eq!(first, second);
        *slot.lock().unwrap() = b;
        assert_ne!(first, second);
    }

    #[test]
    fn test_reader_delegates() {
        let input: SharedInput = Arc::new(TextInput::new("in", "42\n"));
        let mut handle = DelegatingReader::new(move || input.clone());
        let mut text = String::new();
        handle.read_to_string(&mut text).unwrap();
        assert_eq!(text, "42\n");
        assert_eq!(format!("{handle}"), "in");
    }
}
