//! One logical endpoint per kernel channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use kernel_wire::{ChannelName, ChannelRole, DecodeError, EncodeError, Envelope, EnvelopeCodec};
use log::{debug, error, warn};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::dispatcher::{CallbackDispatcher, MessageCallback};
use crate::transport::{Transport, TransportError};

/// How often the backlog forwarder re-checks whether the socket closed.
const BACKLOG_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{0} channel is closed")]
    Closed(ChannelName),

    #[error("{0} channel does not send messages")]
    NotSendable(ChannelName),

    #[error("failed to encode message: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An entry in a queued channel's buffer.
///
/// Requests that failed to decode but kept a readable header travel through
/// the queue too, so they are answered in arrival order on the consumer
/// thread.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Envelope),
    Rejected(DecodeError),
}

impl Inbound {
    fn describe(&self) -> String {
        match self {
            Inbound::Message(message) => {
                format!("{} {}", message.msg_type(), message.header.msg_id)
            }
            Inbound::Rejected(e) => match e.salvaged_header() {
                Some(header) => format!("rejected {} {}", header.msg_type, header.msg_id),
                None => "rejected frame".to_string(),
            },
        }
    }
}

struct Queue {
    tx: Sender<Inbound>,
    rx: Receiver<Inbound>,
    /// Set under [`OverflowPolicy::Block`]: entries go through a forwarder
    /// thread that waits for room, so the I/O thread never blocks.
    backlog: Option<Sender<Inbound>>,
}

/// A kernel channel: Open until [`KernelSocket::close`], then Closed for good.
///
/// The channel's [`ChannelRole`] decides what happens to inbound frames:
/// queued channels buffer them for a consumer thread, immediate channels run
/// callbacks on the I/O thread, loopback channels echo them, and broadcast
/// channels ignore them.
pub struct KernelSocket {
    name: ChannelName,
    role: ChannelRole,
    closed: Arc<AtomicBool>,
    dispatcher: CallbackDispatcher,
    queue: Option<Queue>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn EnvelopeCodec>,
}

impl KernelSocket {
    pub fn new(name: ChannelName, transport: Arc<dyn Transport>, queue: QueueConfig) -> Self {
        let role = name.role();
        let closed = Arc::new(AtomicBool::new(false));
        let queue = (role == ChannelRole::Queued).then(|| {
            let (tx, rx) = bounded(queue.capacity);
            let backlog = match queue.overflow {
                OverflowPolicy::Drop => None,
                OverflowPolicy::Block => {
                    spawn_backlog(name, (tx.clone(), rx.clone()), closed.clone())
                }
            };
            Queue { tx, rx, backlog }
        });
        Self {
            name,
            role,
            closed,
            dispatcher: CallbackDispatcher::new(),
            queue,
            codec: transport.codec(),
            transport,
        }
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_message(&self, callback: MessageCallback) {
        self.dispatcher.register(callback);
    }

    /// Encode and hand `message` to the transport's peer(s) for this channel.
    pub fn send(&self, message: &Envelope) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.name));
        }
        if self.role == ChannelRole::Loopback {
            return Err(ChannelError::NotSendable(self.name));
        }
        let frame = self.codec.encode(self.name, message)?;
        self.transport.send(self.name, frame)?;
        Ok(())
    }

    /// Handle one inbound frame according to the channel's role. Never
    /// blocks the calling I/O thread.
    ///
    /// Decode failures are returned, except on queued channels where a
    /// failure with a salvaged header is queued for the consumer.
    pub(crate) fn receive(&self, frame: Bytes) -> Result<(), DecodeError> {
        if self.is_closed() {
            return Ok(());
        }
        match self.role {
            ChannelRole::Loopback => {
                if let Err(e) = self.transport.send(self.name, frame) {
                    debug!("[socket] {} echo failed: {e}", self.name);
                }
            }
            ChannelRole::Broadcast => {
                debug!("[socket] Ignoring inbound frame on {}", self.name);
            }
            ChannelRole::Immediate => {
                let message = self.codec.decode(self.name, &frame)?;
                let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(&message)));
                if result.is_err() {
                    error!(
                        "[socket] {} callback panicked handling {}",
                        self.name,
                        message.msg_type()
                    );
                }
            }
            ChannelRole::Queued => match self.codec.decode(self.name, &frame) {
                Ok(message) => self.offer(Inbound::Message(message)),
                Err(e) if e.salvaged_header().is_some() => self.offer(Inbound::Rejected(e)),
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    fn offer(&self, entry: Inbound) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Some(backlog) = &queue.backlog {
            if let Err(e) = backlog.send(entry) {
                debug!(
                    "[socket] {} backlog is gone, dropping {}",
                    self.name,
                    e.into_inner().describe()
                );
            }
            return;
        }
        match queue.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => warn!(
                "[socket] {} queue full ({} messages), dropping {}",
                self.name,
                queue.tx.capacity().unwrap_or_default(),
                entry.describe()
            ),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Run the registered callbacks for `message`. A no-op once closed.
    pub fn dispatch(&self, message: &Envelope) {
        if self.is_closed() {
            return;
        }
        self.dispatcher.run_callbacks(message);
    }

    /// The consumer end of a queued channel's buffer.
    pub(crate) fn queue(&self) -> Option<&Receiver<Inbound>> {
        self.queue.as_ref().map(|queue| &queue.rx)
    }

    /// Number of entries waiting for the consumer, not counting a backlog.
    pub fn queued(&self) -> usize {
        self.queue.as_ref().map_or(0, |queue| queue.rx.len())
    }

    /// Close the channel, discarding queued messages and callbacks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.clear();
        if let Some(queue) = &self.queue {
            let discarded = queue.rx.try_iter().count();
            if discarded > 0 {
                debug!("[socket] {} discarded {discarded} queued messages", self.name);
            }
        }
    }
}

/// Start the thread that moves backlogged entries into a full queue as room
/// frees up. Falls back to dropping on overflow if it cannot start.
fn spawn_backlog(
    name: ChannelName,
    queue: (Sender<Inbound>, Receiver<Inbound>),
    closed: Arc<AtomicBool>,
) -> Option<Sender<Inbound>> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name(format!("kerneld-{name}-backlog"))
        .spawn(move || forward_backlog(name, &rx, &queue, &closed));
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            error!("[socket] Failed to start {name} backlog, overflow will drop: {e}");
            None
        }
    }
}

fn forward_backlog(
    name: ChannelName,
    backlog: &Receiver<Inbound>,
    (queue, queued): &(Sender<Inbound>, Receiver<Inbound>),
    closed: &AtomicBool,
) {
    loop {
        let mut entry = match backlog.recv_timeout(BACKLOG_POLL) {
            Ok(entry) => entry,
            Err(RecvTimeoutError::Timeout) if !closed.load(Ordering::Acquire) => continue,
            Err(_) => break,
        };
        let mut waiting = false;
        loop {
            if closed.load(Ordering::Acquire) {
                debug!("[socket] {name} backlog stopped");
                return;
            }
            match queue.send_timeout(entry, BACKLOG_POLL) {
                // An entry that lands after close drained the queue is discarded here.
                Ok(()) if closed.load(Ordering::Acquire) => {
                    queued.try_iter().for_each(drop);
                    return;
                }
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if !waiting {
                        debug!("[socket] {name} queue full, holding {}", returned.describe());
                        waiting = true;
                    }
                    entry = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
    debug!("[socket] {name} backlog stopped");
}
