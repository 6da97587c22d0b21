//! Byte transports under the socket manager.
//!
//! A transport moves opaque frames for the five channels. Two bindings exist:
//!
//! - [`TcpTransport`]: one TCP listener per channel, one peer per channel,
//!   signed multipart frames (the classic Jupyter layout over TCP)
//! - [`SharedTransport`]: one TCP listener, any number of peers, every frame
//!   tagged with the channel it belongs to
//!
//! Both run their I/O on a tokio runtime owned by the thread that calls
//! [`Transport::run`]. Sends may come from any thread; they are queued onto a
//! per-peer writer task.

pub mod framing;
mod shared;
mod tcp;

pub(crate) use framing::{read_frame, WireMode};

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use kernel_wire::{ChannelName, EnvelopeCodec};
use log::{debug, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

pub use shared::SharedTransport;
pub use tcp::TcpTransport;

/// How long a closing transport waits for queued frames to reach peers.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every inbound frame with the channel it arrived on.
pub type InboundSink = Arc<dyn Fn(ChannelName, Bytes) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("transport is closed")]
    Closed,

    #[error("transport is already running")]
    AlreadyRunning,
}

pub trait Transport: Send + Sync {
    /// Accept and serve peers until [`Transport::close`] is called.
    fn run(&self, sink: InboundSink) -> Result<(), TransportError>;

    /// Queue a frame for the peer(s) of `channel`. Frames for a channel with
    /// no peer are dropped.
    fn send(&self, channel: ChannelName, frame: Bytes) -> Result<(), TransportError>;

    /// Stop accepting, flush queued frames, and disconnect every peer.
    fn close(&self);

    /// The envelope codec frames on this transport use.
    fn codec(&self) -> Arc<dyn EnvelopeCodec>;
}

pub(crate) fn runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

pub(crate) struct Peer {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<Bytes>,
    pub reader: AbortHandle,
}

/// Shutdown flag plus the writer tasks that must drain before exit.
pub(crate) struct Lifecycle {
    shutdown: watch::Sender<bool>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            shutdown: watch::channel(false).0,
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the transport is closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let done = *rx.borrow_and_update();
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn track_writer(&self, handle: JoinHandle<()>) {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        writers.retain(|h| !h.is_finished());
        writers.push(handle);
    }

    /// Wait for writers whose senders have been dropped to finish.
    pub async fn drain_writers(&self) {
        let writers =
            std::mem::take(&mut *self.writers.lock().unwrap_or_else(PoisonError::into_inner));
        let drain = async {
            for writer in writers {
                let _ = writer.await;
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, drain).await.is_err() {
            warn!("[transport] Timed out flushing frames to peers");
        }
    }
}

/// Spawn a task that writes queued frames to `write` until every sender is
/// dropped or the connection fails.
pub(crate) fn spawn_writer(
    mut write: OwnedWriteHalf,
    mode: WireMode,
    label: String,
) -> (mpsc::UnboundedSender<Bytes>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let handle = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;

        while let Some(frame) = rx.recv().await {
            if let Err(e) = framing::write_frame(&mut write, mode, &frame).await {
                debug!("[transport] Write to {label} failed: {e}");
                break;
            }
        }
        let _ = write.shutdown().await;
    });
    (tx, handle)
}
