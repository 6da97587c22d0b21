//! kerneld - a notebook kernel transport.
//!
//! The crate wires the wire codecs of `kernel-wire` and the stream capture of
//! `kernel-streams` into a running kernel:
//!
//! - [`transport`]: the physical (one TCP socket per channel) and shared (all
//!   channels over one connection) bindings
//! - [`socket_manager`]: the five channels, their consumer threads and the
//!   heartbeat loop-back
//! - [`status`]: the busy/idle bracket
//! - [`kernel`]: request routing to an [`ExecutionEngine`](kernel::ExecutionEngine)
//!   with per-execution output capture
//!
//! ```no_run
//! use std::sync::Arc;
//! use kerneld::{config::KernelConfig, echo::EchoEngine, Binding};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = KernelConfig::default();
//! let binding = Binding::bind(&config)?;
//! let kernel = kerneld::launch(&config, &binding, Arc::new(EchoEngine));
//! kernel.broadcast_starting();
//! kernel.manager().listen()?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use kernel_streams::{OutputConfig, StreamSubstitutionManager};
use kernel_wire::JsonCodec;

pub mod config;
pub mod dispatcher;
pub mod echo;
pub mod kernel;
pub mod socket;
pub mod socket_manager;
pub mod status;
pub mod stdin;
pub mod transport;

use config::{ConnectionInfo, KernelConfig, TransportKind};
use kernel::{ExecutionEngine, Kernel};
use socket_manager::SocketManager;
use transport::{SharedTransport, TcpTransport, Transport, TransportError};

/// A bound transport, before anything is served on it.
pub enum Binding {
    Physical(Arc<TcpTransport>),
    Shared(Arc<SharedTransport>),
}

impl Binding {
    /// Bind the listener(s) `config` asks for.
    pub fn bind(config: &KernelConfig) -> Result<Self, TransportError> {
        let json = JsonCodec::builtin();
        Ok(match config.transport {
            TransportKind::Physical => Binding::Physical(Arc::new(TcpTransport::bind(
                &config.connection,
                json,
                config.max_frame_size,
            )?)),
            TransportKind::Shared => Binding::Shared(Arc::new(SharedTransport::bind(
                config.listen,
                json,
                config.max_frame_size,
            )?)),
        })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        match self {
            Binding::Physical(t) => t.clone(),
            Binding::Shared(t) => t.clone(),
        }
    }

    /// The connection file contents for a physical binding, with real ports.
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        match self {
            Binding::Physical(t) => Some(t.connection_info()),
            Binding::Shared(_) => None,
        }
    }

    /// The listen address of a shared binding.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Binding::Physical(_) => None,
            Binding::Shared(t) => Some(t.local_addr()),
        }
    }
}

/// Build the socket manager, stream manager and kernel for `binding`.
///
/// Nothing is served until `kernel.manager().listen()` is called.
pub fn launch(
    config: &KernelConfig,
    binding: &Binding,
    engine: Arc<dyn ExecutionEngine>,
) -> Arc<Kernel> {
    let manager = SocketManager::new(binding.transport(), config.queue);
    let streams = StreamSubstitutionManager::new(
        config.substitution,
        OutputConfig::new(config.capture.clone()),
    );
    Kernel::new(manager, engine, streams)
}
