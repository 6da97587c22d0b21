//! Physical binding: one TCP listener per channel.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use kernel_wire::{ChannelName, EnvelopeCodec, JsonCodec, MultipartCodec};
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};

use super::{
    read_frame, runtime, spawn_writer, InboundSink, Lifecycle, Peer, Transport, TransportError,
    WireMode,
};
use crate::config::{ConfigError, ConnectionInfo};

struct ChannelPeers {
    peers: Mutex<HashMap<ChannelName, Peer>>,
    lifecycle: Lifecycle,
    next_id: AtomicU64,
    max_frame_size: usize,
}

impl ChannelPeers {
    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelName, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mode(&self, channel: ChannelName) -> WireMode {
        match channel {
            ChannelName::Heartbeat => WireMode::Raw,
            _ => WireMode::Framed {
                max: self.max_frame_size,
            },
        }
    }

    /// Make `stream` the peer of `channel`, replacing any previous one.
    fn attach(self: &Arc<Self>, channel: ChannelName, stream: TcpStream, sink: InboundSink) {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mode = self.mode(channel);
        let (read, write) = stream.into_split();

        let (tx, writer) = spawn_writer(write, mode, format!("{channel} peer {id}"));
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
                    Ok(Some(frame)) => sink(channel, frame),
                    Ok(None) => {
                        debug!("[transport] {channel} peer {id} disconnected");
                        break;
                    }
                    Err(e) => {
                        error!("[transport] {channel} peer {id} read error: {e}");
                        break;
                    }
                }
            }
            peers.detach(channel, id);
        });

        let previous = self.peers().insert(
            channel,
            Peer {
                id,
                tx,
                reader: reader.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            info!("[transport] {channel} peer {id} replaced peer {}", previous.id);
            previous.reader.abort();
        }
    }

    fn detach(&self, channel: ChannelName, id: u64) {
        let mut peers = self.peers();
        if peers.get(&channel).is_some_and(|peer| peer.id == id) {
            peers.remove(&channel);
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        channel: ChannelName,
        listener: TcpListener,
        sink: InboundSink,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("[transport] {channel} connection from {addr}");
                        self.attach(channel, stream, sink.clone());
                    }
                    Err(e) => error!("[transport] Accept error on {channel}: {e}"),
                },
                _ = self.lifecycle.closed() => break,
            }
        }
    }
}

/// One listener per channel at the ports of a connection file.
///
/// Each channel has at most one peer; a newer connection replaces the older
/// one. Heartbeat bytes are unframed, every other channel carries
/// length-prefixed signed multipart frames.
pub struct TcpTransport {
    info: ConnectionInfo,
    listeners: Mutex<Option<Vec<(ChannelName, std::net::TcpListener)>>>,
    state: Arc<ChannelPeers>,
    codec: Arc<MultipartCodec>,
}

impl TcpTransport {
    /// Bind all five listeners. Ports of 0 are replaced by the ports the OS
    /// picked; see [`TcpTransport::connection_info`].
    pub fn bind(
        info: &ConnectionInfo,
        json: JsonCodec,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let signer = info.signer()?;
        let ip: IpAddr = info
            .ip
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(info.ip.clone()))?;

        let mut resolved = info.clone();
        let mut listeners = Vec::with_capacity(ChannelName::ALL.len());
        for channel in ChannelName::ALL {
            let listener = std::net::TcpListener::bind(SocketAddr::new(ip, info.port(channel)))?;
            listener.set_nonblocking(true)?;
            resolved.set_port(channel, listener.local_addr()?.port());
            listeners.push((channel, listener));
        }

        Ok(Self {
            info: resolved,
            listeners: Mutex::new(Some(listeners)),
            state: Arc::new(ChannelPeers {
                peers: Mutex::new(HashMap::new()),
                lifecycle: Lifecycle::new(),
                next_id: AtomicU64::new(1),
                max_frame_size,
            }),
            codec: Arc::new(MultipartCodec::new(json, signer)),
        })
    }

    /// The connection info with the ports actually bound.
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn serve(
        &self,
        listeners: Vec<(ChannelName, std::net::TcpListener)>,
        sink: InboundSink,
    ) -> Result<(), TransportError> {
        for (channel, listener) in listeners {
            let listener = TcpListener::from_std(listener)?;
            info!(
                "[transport] {channel} listening on {}",
                listener.local_addr()?
            );
            tokio::spawn(self.state.clone().accept_loop(channel, listener, sink.clone()));
        }

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

impl Transport for TcpTransport {
    fn run(&self, sink: InboundSink) -> Result<(), TransportError> {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyRunning)?;
        if self.state.lifecycle.is_closed() {
            return Ok(());
        }
        runtime()?.block_on(self.serve(listeners, sink))
    }

    fn send(&self, channel: ChannelName, frame: Bytes) -> Result<(), TransportError> {
        if self.state.lifecycle.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.state.peers().get(&channel) {
            Some(peer) => {
                if peer.tx.send(frame).is_err() {
                    debug!("[transport] {channel} peer {} is gone", peer.id);
                }
            }
            None => debug!("[transport] No {channel} peer, dropping frame"),
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
