//! Shared-connection binding: every channel over one connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use kernel_wire::{ChannelName, DecodeError, EnvelopeCodec, JsonCodec, SharedFrameCodec};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use super::{
    read_frame, runtime, spawn_writer, InboundSink, Lifecycle, Peer, Transport, TransportError,
    WireMode,
};

struct ConnectionPeers {
    peers: Mutex<HashMap<u64, Peer>>,
    lifecycle: Lifecycle,
    next_id: AtomicU64,
    max_frame_size: usize,
}

impl ConnectionPeers {
    fn peers(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, sink: InboundSink) {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mode = WireMode::Framed {
            max: self.max_frame_size,
        };
        let (read, write) = stream.into_split();

        let (tx, writer) = spawn_writer(write, mode, format!("peer {id} ({addr})"));
        self.lifecycle.track_writer(writer);

        let peers = self.clone();
        let reader = tokio::spawn(async move {
            let mut read = read;
            loop {
                let frame = tokio::select! {
                    frame = read_frame(&mut read, mode) => frame,
                    _ = peers.lifecycle.closed() => break,
                };
                match frame {
                    Ok(Some(frame)) => route(&sink, id, frame),
                    Ok(None) => {
                        info!("[transport] Peer {id} disconnected");
                        break;
                    }
                    Err(e) => {
                        error!("[transport] Peer {id} read error: {e}");
                        break;
                    }
                }
            }
            peers.peers().remove(&id);
        });

        self.peers().insert(
            id,
            Peer {
                id,
                tx,
                reader: reader.abort_handle(),
            },
        );
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, sink: InboundSink) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("[transport] Connection from {addr}");
                        self.attach(stream, addr, sink.clone());
                    }
                    Err(e) => error!("[transport] Accept error: {e}"),
                },
                _ = self.lifecycle.closed() => break,
            }
        }
    }
}

/// Hand a frame to the sink under the channel it names.
fn route(sink: &InboundSink, peer: u64, frame: Bytes) {
    match SharedFrameCodec::peek_channel(&frame) {
        Ok(channel) => sink(channel, frame),
        Err(DecodeError::UnknownChannel(name)) => {
            warn!("[transport] Peer {peer} sent a frame for unknown channel {name:?}, dropping");
        }
        Err(e) => warn!("[transport] Peer {peer} sent a malformed frame, dropping: {e}"),
    }
}

/// One listener whose connections each carry all five channels.
///
/// Any number of peers may connect. Every outbound frame goes to every
/// connected peer.
pub struct SharedTransport {
    local_addr: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
    state: Arc<ConnectionPeers>,
    codec: Arc<SharedFrameCodec>,
}

impl SharedTransport {
    pub fn bind(
        addr: SocketAddr,
        json: JsonCodec,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            local_addr: listener.local_addr()?,
            listener: Mutex::new(Some(listener)),
            state: Arc::new(ConnectionPeers {
                peers: Mutex::new(HashMap::new()),
                lifecycle: Lifecycle::new(),
                next_id: AtomicU64::new(1),
                max_frame_size,
            }),
            codec: Arc::new(SharedFrameCodec::new(json)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers().len()
    }

    async fn serve(
        &self,
        listener: std::net::TcpListener,
        sink: InboundSink,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::from_std(listener)?;
        info!("[transport] Listening on {}", self.local_addr);
        tokio::spawn(self.state.clone().accept_loop(listener, sink));

        self.state.lifecycle.closed().await;

        let peers: Vec<Peer> = self.state.peers().drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.reader.abort();
        }
        drop(peers);
        self.state.lifecycle.drain_writers().await;
        info!("[transport] Stopped");
        Ok(())
    }
}

impl Transport for SharedTransport {
    fn run(&self, sink: InboundSink) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyRunning)?;
        if self.state.lifecycle.is_closed() {
            return Ok(());
        }
        runtime()?.block_on(self.serve(listener, sink))
    }

    fn send(&self, channel: ChannelName, frame: Bytes) -> Result<(), TransportError> {
        if self.state.lifecycle.is_closed() {
            return Err(TransportError::Closed);
        }
        let peers = self.state.peers();
        if peers.is_empty() {
            debug!("[transport] No peers, dropping {channel} frame");
        }
        for peer in peers.values() {
            if peer.tx.send(frame.clone()).is_err() {
                debug!("[transport] Peer {} is gone", peer.id);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lifecycle.close();
    }

    fn codec(&self) -> Arc<dyn EnvelopeCodec> {
        self.codec.clone()
    }
}
