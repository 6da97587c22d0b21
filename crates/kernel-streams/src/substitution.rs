//! Scoped replacement of a process-wide stream.
//!
//! An engine owns one stream role (stdout, stderr or stdin). It keeps a
//! globally visible slot plus, for the non-blocking engine, a per-thread
//! override so that a thread always observes its own innermost scope.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use log::{debug, warn};
use thiserror::Error;

use crate::lock;

/// Releases a stream once its scope has ended.
pub type Finalizer<T> = Arc<dyn Fn(&T) -> io::Result<()> + Send + Sync>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("this thread already holds the substitution lock")]
    Reentrant,
}

/// Which engine a stream service uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubstitutionMode {
    /// One substitution at a time, kernel-wide.
    Blocking,
    /// Concurrent, possibly overlapping scopes.
    #[default]
    NonBlocking,
}

impl fmt::Display for SubstitutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstitutionMode::Blocking => f.write_str("blocking"),
            SubstitutionMode::NonBlocking => f.write_str("non-blocking"),
        }
    }
}

impl FromStr for SubstitutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(SubstitutionMode::Blocking),
            "non-blocking" | "nonblocking" => Ok(SubstitutionMode::NonBlocking),
            other => Err(format!("unknown substitution mode: {other}")),
        }
    }
}

trait Release<T: ?Sized>: Send + Sync {
    fn release(&self, id: u64);
}

/// An active substitution. Dropping it ends the scope, in any order
/// relative to other guards and on any thread.
#[must_use = "the substitution ends when the guard is dropped"]
pub struct ScopeGuard<T: ?Sized> {
    owner: Arc<dyn Release<T>>,
    id: u64,
    stream: Arc<T>,
}

impl<T: ?Sized> ScopeGuard<T> {
    /// The stream installed by this scope.
    pub fn stream(&self) -> &Arc<T> {
        &self.stream
    }
}

impl<T: ?Sized> Drop for ScopeGuard<T> {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

impl<T: ?Sized> fmt::Debug for ScopeGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard").field("id", &self.id).finish()
    }
}

fn finalize<T: ?Sized>(finalizer: &Finalizer<T>, stream: &T) {
    if let Err(e) = finalizer(stream) {
        warn!("[streams] Failed to release substituted stream: {e}");
    }
}

// ---------------------------------------------------------------------------
// Non-blocking engine
// ---------------------------------------------------------------------------

struct Scope<T: ?Sized> {
    id: u64,
    thread: ThreadId,
    stream: Arc<T>,
}

struct NonBlockingState<T: ?Sized> {
    /// Active scopes in acquisition order. The last one is the tail.
    scopes: Vec<Scope<T>>,
    /// The globally visible stream.
    slot: Arc<T>,
    /// Each thread's own scopes, innermost last.
    per_thread: HashMap<ThreadId, Vec<(u64, Arc<T>)>>,
}

struct NonBlockingInner<T: ?Sized> {
    default: Arc<T>,
    finalizer: Finalizer<T>,
    state: Mutex<NonBlockingState<T>>,
    next_id: AtomicU64,
}

impl<T: ?Sized + Send + Sync> Release<T> for NonBlockingInner<T> {
    fn release(&self, id: u64) {
        let removed = {
            let mut state = lock(&self.state);
            let Some(pos) = state.scopes.iter().position(|s| s.id == id) else {
                return;
            };
            let was_tail = pos + 1 == state.scopes.len();
            let scope = state.scopes.remove(pos);

            if let Some(stack) = state.per_thread.get_mut(&scope.thread) {
                stack.retain(|(scope_id, _)| *scope_id != id);
                if stack.is_empty() {
                    state.per_thread.remove(&scope.thread);
                }
            }

            if was_tail {
                state.slot = match state.scopes.last() {
                    Some(tail) => tail.stream.clone(),
                    None => self.default.clone(),
                };
            } else {
                debug!("[streams] Scope {id} ended out of order; visible stream unchanged");
            }
            scope.stream
        };
        finalize(&self.finalizer, &removed);
    }
}

/// Engine allowing any number of concurrent scopes.
///
/// Scopes may end in any order. Only the scope that is currently the tail
/// updates the visible slot when it ends.
pub struct NonBlockingEngine<T: ?Sized> {
    inner: Arc<NonBlockingInner<T>>,
}

impl<T: ?Sized> Clone for NonBlockingEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> NonBlockingEngine<T> {
    pub fn new(default: Arc<T>, finalizer: Finalizer<T>) -> Self {
        Self {
            inner: Arc::new(NonBlockingInner {
                default: default.clone(),
                finalizer,
                state: Mutex::new(NonBlockingState {
                    scopes: Vec::new(),
                    slot: default,
                    per_thread: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Install a stream built from the current tail (or the default).
    pub fn enter(&self, factory: impl FnOnce(Arc<T>) -> Arc<T>) -> ScopeGuard<T> {
        let fallback = {
            let state = lock(&self.inner.state);
            match state.scopes.last() {
                Some(tail) => tail.stream.clone(),
                None => self.inner.default.clone(),
            }
        };
        let stream = factory(fallback);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = thread::current().id();
        {
            let mut state = lock(&self.inner.state);
            state.scopes.push(Scope {
                id,
                thread,
                stream: stream.clone(),
            });
            state
                .per_thread
                .entry(thread)
                .or_default()
                .push((id, stream.clone()));
            state.slot = stream.clone();
        }

        ScopeGuard {
            owner: self.inner.clone(),
            id,
            stream,
        }
    }

    /// The calling thread's innermost scope, else the visible slot.
    pub fn current(&self) -> Arc<T> {
        let state = lock(&self.inner.state);
        state
            .per_thread
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(|(_, stream)| stream.clone())
            .unwrap_or_else(|| state.slot.clone())
    }

    pub fn global(&self) -> Arc<T> {
        lock(&self.inner.state).slot.clone()
    }

    pub fn default_stream(&self) -> Arc<T> {
        self.inner.default.clone()
    }

    pub fn active_scopes(&self) -> usize {
        lock(&self.inner.state).scopes.len()
    }
}

// ---------------------------------------------------------------------------
// Blocking engine
// ---------------------------------------------------------------------------

struct Claim<T: ?Sized> {
    id: u64,
    thread: ThreadId,
    previous: Arc<T>,
    installed: Option<Arc<T>>,
}

struct BlockingState<T: ?Sized> {
    claim: Option<Claim<T>>,
    slot: Arc<T>,
}

struct BlockingInner<T: ?Sized> {
    default: Arc<T>,
    finalizer: Finalizer<T>,
    state: Mutex<BlockingState<T>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl<T: ?Sized + Send + Sync> Release<T> for BlockingInner<T> {
    fn release(&self, id: u64) {
        let installed = {
            let mut state = lock(&self.state);
            if state.claim.as_ref().map(|claim| claim.id) != Some(id) {
                return;
            }
            let Some(claim) = state.claim.take() else {
                return;
            };
            state.slot = claim.previous;
            claim.installed
        };
        self.released.notify_one();
        if let Some(stream) = installed {
            finalize(&self.finalizer, &stream);
        }
    }
}

/// Engine allowing a single substitution at a time, kernel-wide.
///
/// A second thread waits for the first scope to end. The holding thread
/// entering again gets [`SubstitutionError::Reentrant`].
pub struct BlockingEngine<T: ?Sized> {
    inner: Arc<BlockingInner<T>>,
}

impl<T: ?Sized> Clone for BlockingEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> BlockingEngine<T> {
    pub fn new(default: Arc<T>, finalizer: Finalizer<T>) -> Self {
        Self {
            inner: Arc::new(BlockingInner {
                default: default.clone(),
                finalizer,
                state: Mutex::new(BlockingState {
                    claim: None,
                    slot: default,
                }),
                released: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn enter(
        &self,
        factory: impl FnOnce(Arc<T>) -> Arc<T>,
    ) -> Result<ScopeGuard<T>, SubstitutionError> {
        let me = thread::current().id();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = {
            let mut state = lock(&self.inner.state);
            loop {
                match &state.claim {
                    Some(claim) if claim.thread == me => return Err(SubstitutionError::Reentrant),
                    Some(_) => {
                        state = self
                            .inner
                            .released
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    None => break,
                }
            }
            let previous = state.slot.clone();
            state.claim = Some(Claim {
                id,
                thread: me,
                previous: previous.clone(),
                installed: None,
            });
            previous
        };

        let stream = match panic::catch_unwind(AssertUnwindSafe(|| factory(previous))) {
            Ok(stream) => stream,
            Err(payload) => {
                self.inner.release(id);
                panic::resume_unwind(payload);
            }
        };

        {
            let mut state = lock(&self.inner.state);
            state.slot = stream.clone();
            if let Some(claim) = state.claim.as_mut() {
                claim.installed = Some(stream.clone());
            }
        }

        Ok(ScopeGuard {
            owner: self.inner.clone(),
            id,
            stream,
        })
    }

    pub fn current(&self) -> Arc<T> {
        lock(&self.inner.state).slot.clone()
    }

    pub fn global(&self) -> Arc<T> {
        self.current()
    }

    pub fn default_stream(&self) -> Arc<T> {
        self.inner.default.clone()
    }

    pub fn is_held(&self) -> bool {
        lock(&self.inner.state).claim.is_some()
    }
}

// ---------------------------------------------------------------------------
// Either engine
// ---------------------------------------------------------------------------

/// A stream role's engine, selected by [`SubstitutionMode`].
pub enum SubstitutionEngine<T: ?Sized> {
    Blocking(BlockingEngine<T>),
    NonBlocking(NonBlockingEngine<T>),
}

impl<T: ?Sized> Clone for SubstitutionEngine<T> {
    fn clone(&self) -> Self {
        match self {
            SubstitutionEngine::Blocking(engine) => SubstitutionEngine::Blocking(engine.clone()),
            SubstitutionEngine::NonBlocking(engine) => {
                SubstitutionEngine::NonBlocking(engine.clone())
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for SubstitutionEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubstitutionEngine").field(&self.mode()).finish()
    }
}

impl<T: ?Sized> SubstitutionEngine<T> {
    pub fn mode(&self) -> SubstitutionMode {
        match self {
            SubstitutionEngine::Blocking(_) => SubstitutionMode::Blocking,
            SubstitutionEngine::NonBlocking(_) => SubstitutionMode::NonBlocking,
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> SubstitutionEngine<T> {
    pub fn new(mode: SubstitutionMode, default: Arc<T>, finalizer: Finalizer<T>) -> Self {
        match mode {
            SubstitutionMode::Blocking => {
                SubstitutionEngine::Blocking(BlockingEngine::new(default, finalizer))
            }
            SubstitutionMode::NonBlocking => {
                SubstitutionEngine::NonBlocking(NonBlockingEngine::new(default, finalizer))
            }
        }
    }

    /// The stream a read or write on the calling thread should reach.
    pub fn current(&self) -> Arc<T> {
        match self {
            SubstitutionEngine::Blocking(engine) => engine.current(),
            SubstitutionEngine::NonBlocking(engine) => engine.current(),
        }
    }

    pub fn global(&self) -> Arc<T> {
        match self {
            SubstitutionEngine::Blocking(engine) => engine.global(),
            SubstitutionEngine::NonBlocking(engine) => engine.global(),
        }
    }

    pub fn default_stream(&self) -> Arc<T> {
        match self {
            SubstitutionEngine::Blocking(engine) => engine.default_stream(),
            SubstitutionEngine::NonBlocking(engine) => engine.default_stream(),
        }
    }

    pub fn enter(
        &self,
        factory: impl FnOnce(Arc<T>) -> Arc<T>,
    ) -> Result<ScopeGuard<T>, SubstitutionError> {
        match self {
            SubstitutionEngine::Blocking(engine) => engine.enter(factory),
            SubstitutionEngine::NonBlocking(engine) => Ok(engine.enter(factory)),
        }
    }

    /// Run `body` with the stream built by `factory` installed. The previous
    /// stream is restored when `body` returns or panics.
    pub fn with_substitution<R>(
        &self,
        factory: impl FnOnce(Arc<T>) -> Arc<T>,
        body: impl FnOnce(&Arc<T>) -> R,
    ) -> Result<R, SubstitutionError> {
        let guard = self.enter(factory)?;
        let result = body(guard.stream());
        drop(guard);
        Ok(result)
    }
}
