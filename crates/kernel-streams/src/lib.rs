//! Process-wide output/input streams for a kernel, and the machinery to
//! redirect them into per-execution capture buffers.
//!
//! Nothing here touches the real process file descriptors. A kernel owns one
//! [`StreamSubstitutionManager`]; execution engines write to the handles it
//! hands out ([`DelegatingWriter`], [`DelegatingReader`]) and every write is
//! routed to whatever stream is installed for the current scope.

mod capture;
mod delegating;
mod manager;
mod stream;
mod substitution;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use capture::{CaptureCallback, CaptureConfig, CapturingOutputStream, OutputConfig};
pub use delegating::{DelegatingReader, DelegatingWriter};
pub use manager::{CaptureScope, StreamSubstitutionManager};
pub use stream::{
    BufferOutput, InputStream, NoInput, OutputStream, ProcessStderr, ProcessStdout, SharedInput,
    SharedOutput, TextInput,
};
pub use substitution::{
    BlockingEngine, Finalizer, NonBlockingEngine, ScopeGuard, SubstitutionEngine,
    SubstitutionError, SubstitutionMode,
};

/// Lock, recovering the guard if a panicking execution poisoned the mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
