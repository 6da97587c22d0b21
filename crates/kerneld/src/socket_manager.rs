//! Owns the five channels of one transport binding and runs them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{select, Receiver, Sender};
use kernel_wire::{ChannelName, DecodeError};
use log::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::socket::{Inbound, KernelSocket};
use crate::transport::{InboundSink, Transport, TransportError};

/// Receives decode failures that still carry a readable header.
pub type DecodeErrorHandler = Arc<dyn Fn(ChannelName, &DecodeError) + Send + Sync>;

pub struct SocketManager {
    transport: Arc<dyn Transport>,
    heartbeat: Arc<KernelSocket>,
    shell: Arc<KernelSocket>,
    control: Arc<KernelSocket>,
    stdin: Arc<KernelSocket>,
    iopub: Arc<KernelSocket>,
    /// Dropped on close; consumers treat the disconnect as their stop signal.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    decode_error: RwLock<Option<DecodeErrorHandler>>,
    closed: AtomicBool,
}

impl SocketManager {
    pub fn new(transport: Arc<dyn Transport>, queue: QueueConfig) -> Arc<Self> {
        let socket = |name| Arc::new(KernelSocket::new(name, transport.clone(), queue));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            heartbeat: socket(ChannelName::Heartbeat),
            shell: socket(ChannelName::Shell),
            control: socket(ChannelName::Control),
            stdin: socket(ChannelName::Stdin),
            iopub: socket(ChannelName::Iopub),
            transport,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            decode_error: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn socket(&self, name: ChannelName) -> &Arc<KernelSocket> {
        match name {
            ChannelName::Heartbeat => &self.heartbeat,
            ChannelName::Shell => &self.shell,
            ChannelName::Control => &self.control,
            ChannelName::Stdin => &self.stdin,
            ChannelName::Iopub => &self.iopub,
        }
    }

    pub fn heartbeat(&self) -> &Arc<KernelSocket> {
        &self.heartbeat
    }

    pub fn shell(&self) -> &Arc<KernelSocket> {
        &self.shell
    }

    pub fn control(&self) -> &Arc<KernelSocket> {
        &self.control
    }

    pub fn stdin(&self) -> &Arc<KernelSocket> {
        &self.stdin
    }

    pub fn iopub(&self) -> &Arc<KernelSocket> {
        &self.iopub
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Replace the handler for decode errors that salvaged a header. Errors
    /// without one are logged and dropped.
    pub fn on_decode_error(&self, handler: DecodeErrorHandler) {
        *self
            .decode_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Start the queue consumers and serve the transport on this thread until
    /// [`SocketManager::close`].
    ///
    /// Returns once every consumer has been joined.
    pub fn listen(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut consumers = Vec::new();
        for socket in [&self.shell, &self.control] {
            match self.spawn_consumer(socket.clone()) {
                Ok(handle) => consumers.push((socket.name(), handle)),
                Err(e) => {
                    error!("[socket] Failed to start {} consumer: {e}", socket.name());
                    self.close();
                    join_consumers(consumers);
                    return Err(e.into());
                }
            }
        }

        info!("[socket] Serving transport");
        let result = self.transport.run(self.sink());
        if let Err(e) = &result {
            error!("[socket] Transport failed: {e}");
        }

        self.close();
        join_consumers(consumers);
        info!("[socket] Stopped");
        result
    }

    /// Close every channel and stop the transport. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[socket] Closing");
        for name in ChannelName::ALL {
            self.socket(name).close();
        }
        drop(
            self.shutdown_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.transport.close();
    }

    fn sink(self: &Arc<Self>) -> InboundSink {
        let manager = Arc::downgrade(self);
        Arc::new(move |channel: ChannelName, frame: Bytes| {
            if let Some(manager) = manager.upgrade() {
                manager.route(channel, frame);
            }
        })
    }

    fn route(&self, channel: ChannelName, frame: Bytes) {
        if let Err(e) = self.socket(channel).receive(frame) {
            self.reject(channel, &e);
        }
    }

    /// Hand a decode failure to the handler if it kept a header; otherwise
    /// the frame is only logged.
    fn reject(&self, channel: ChannelName, e: &DecodeError) {
        let handler = self
            .decode_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (e.salvaged_header(), handler) {
            (Some(header), Some(handler)) => {
                warn!(
                    "[socket] Rejected {} {} on {channel}: {e}",
                    header.msg_type, header.msg_id
                );
                handler(channel, e);
            }
            _ => warn!("[socket] Dropping malformed frame on {channel}: {e}"),
        }
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        socket: Arc<KernelSocket>,
    ) -> std::io::Result<JoinHandle<()>> {
        let queue = match socket.queue() {
            Some(queue) => queue.clone(),
            None => crossbeam_channel::never(),
        };
        let shutdown = self.shutdown_rx.clone();
        let manager: Weak<Self> = Arc::downgrade(self);

        thread::Builder::new()
            .name(format!("kerneld-{}", socket.name()))
            .spawn(move || {
                let consumed = panic::catch_unwind(AssertUnwindSafe(|| {
                    consume(&socket, &queue, &shutdown, &manager)
                }));
                if consumed.is_err() {
                    error!("[socket] {} consumer panicked, shutting down", socket.name());
                    if let Some(manager) = manager.upgrade() {
                        manager.close();
                    }
                }
            })
    }
}

fn consume(
    socket: &KernelSocket,
    queue: &Receiver<Inbound>,
    shutdown: &Receiver<()>,
    manager: &Weak<SocketManager>,
) {
    loop {
        select! {
            recv(queue) -> entry => match entry {
                Ok(Inbound::Message(message)) => socket.dispatch(&message),
                Ok(Inbound::Rejected(e)) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.reject(socket.name(), &e);
                    }
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("[socket] {} consumer exiting", socket.name());
}

fn join_consumers(consumers: Vec<(ChannelName, JoinHandle<()>)>) {
    for (name, handle) in consumers {
        if handle.join().is_err() {
            error!("[socket] {name} consumer thread failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::RecordingTransport;
    use kernel_wire::{Envelope, ExecuteRequest, MessageContent, Session};
    use std::time::Duration;

    fn execute(session: &Session, code: &str) -> Envelope {
        session.message(
            MessageContent::ExecuteRequest(ExecuteRequest::new(code)),
            None,
        )
    }

    fn start(manager: &Arc<SocketManager>) -> JoinHandle<Result<(), TransportError>> {
        let manager = manager.clone();
        thread::spawn(move || manager.listen())
    }

    #[test]
    fn test_shell_messages_reach_consumer_in_order() {
        let transport = RecordingTransport::new();
        let manager = SocketManager::new(transport.clone(), QueueConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        manager.shell().on_message(Arc::new(move |msg: &Envelope| {
            let thread = thread::current().name().map(str::to_string);
            tx.send((msg.header.msg_id.clone(), thread)).unwrap();
        }));
        let listener = start(&manager);

        let session = Session::new("test");
        let requests: Vec<Envelope> = (0..5).map(|i| execute(&session, &i.to_string())).collect();
        for request in &requests {
            transport.inject(ChannelName::Shell, request);
        }

        for request in &requests {
            let (id, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(id, request.header.msg_id);
            assert_eq!(thread.as_deref(), Some("kerneld-shell"));
        }

        manager.close();
        listener.join().unwrap().unwrap();
        assert!(transport.is_closed());
    }

    #[test]
    fn test_heartbeat_wired_at_construction() {
        let transport = RecordingTransport::new();
        let manager = SocketManager::new(transport.clone(), QueueConfig::default());
        let listener = start(&manager);

        let msg = execute(&Session::new("test"), "ping");
        transport.inject(ChannelName::Heartbeat, &msg);
        assert_eq!(transport.sent_messages(ChannelName::Heartbeat), vec![msg]);

        manager.close();
        listener.join().unwrap().unwrap();
    }

    #[test]
    fn test_consumer_panic_closes_manager() {
        let transport = RecordingTransport::new();
        let manager = SocketManager::new(transport.clone(), QueueConfig::default());
        manager
            .control()
            .on_message(Arc::new(|_: &Envelope| panic!("handler bug")));
        let listener = start(&manager);

        transport.inject(ChannelName::Control, &execute(&Session::new("test"), "x"));
        listener.join().unwrap().unwrap();
        assert!(manager.is_closed());
        assert!(manager.shell().is_closed());
    }

    #[test]
    fn test_salvaged_decode_errors_are_queued_in_order() {
        let transport = RecordingTransport::new();
        let manager = SocketManager::new(transport.clone(), QueueConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatched = tx.clone();
        manager.shell().on_message(Arc::new(move |msg: &Envelope| {
            dispatched.send(("message", msg.header.msg_id.clone())).unwrap();
        }));
        manager.on_decode_error(Arc::new(move |channel: ChannelName, e: &DecodeError| {
            assert_eq!(channel, ChannelName::Shell);
            assert_eq!(thread::current().name(), Some("kerneld-shell"));
            let id = e.salvaged_header().map(|h| h.msg_id.clone()).unwrap_or_default();
            tx.send(("rejected", id)).unwrap();
        }));

        let session = Session::new("test");
        let first = execute(&session, "1");
        let rejected = execute(&session, "2");
        let last = execute(&session, "3");
        let frame = transport.encode(ChannelName::Shell, &rejected);
        let text = String::from_utf8(frame[1..].to_vec())
            .unwrap()
            .replace("execute_request", "debug_request");
        let mut bogus = vec![0u8];
        bogus.extend_from_slice(text.as_bytes());

        manager.route(ChannelName::Shell, transport.encode(ChannelName::Shell, &first));
        manager.route(ChannelName::Shell, Bytes::from(bogus));
        manager.route(ChannelName::Shell, Bytes::from_static(b"\x00{broken"));
        manager.route(ChannelName::Shell, transport.encode(ChannelName::Shell, &last));
        let listener = start(&manager);

        let seen: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(
            seen,
            vec![
                ("message", first.header.msg_id.clone()),
                ("rejected", rejected.header.msg_id.clone()),
                ("message", last.header.msg_id.clone()),
            ]
        );
        assert!(rx.try_recv().is_err());

        manager.close();
        listener.join().unwrap().unwrap();
    }

    #[test]
    fn test_close_before_listen() {
        let transport = RecordingTransport::new();
        let manager = SocketManager::new(transport, QueueConfig::default());
        manager.close();
        manager.close();
        assert!(manager.listen().is_ok());
    }
}
