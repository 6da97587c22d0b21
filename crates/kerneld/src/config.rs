//! Kernel configuration and the Jupyter connection file.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use kernel_streams::{CaptureConfig, SubstitutionMode};
use kernel_wire::{ChannelName, Signer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::framing::MAX_FRAME_SIZE;

/// Default capacity of each queued channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid connection file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported transport {0:?} (only tcp is supported)")]
    UnsupportedTransport(String),

    #[error("unsupported signature scheme {0:?}")]
    UnsupportedSignatureScheme(String),

    #[error(transparent)]
    Key(#[from] kernel_wire::KeyError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

/// The connection file a notebook frontend hands to a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

impl ConnectionInfo {
    /// Ephemeral ports on `ip` with a fresh signing key. The real ports are
    /// known once the physical transport has bound them.
    pub fn ephemeral(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            transport: default_transport(),
            shell_port: 0,
            iopub_port: 0,
            stdin_port: 0,
            control_port: 0,
            hb_port: 0,
            key: Uuid::new_v4().to_string(),
            signature_scheme: default_signature_scheme(),
            kernel_name: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let info: ConnectionInfo = serde_json::from_str(&text)?;
        info.validate()?;
        Ok(info)
    }

    pub fn write_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport != "tcp" {
            return Err(ConfigError::UnsupportedTransport(self.transport.clone()));
        }
        self.signer().map(|_| ())
    }

    pub fn port(&self, channel: ChannelName) -> u16 {
        match channel {
            ChannelName::Heartbeat => self.hb_port,
            ChannelName::Shell => self.shell_port,
            ChannelName::Control => self.control_port,
            ChannelName::Stdin => self.stdin_port,
            ChannelName::Iopub => self.iopub_port,
        }
    }

    pub fn set_port(&mut self, channel: ChannelName, port: u16) {
        match channel {
            ChannelName::Heartbeat => self.hb_port = port,
            ChannelName::Shell => self.shell_port = port,
            ChannelName::Control => self.control_port = port,
            ChannelName::Stdin => self.stdin_port = port,
            ChannelName::Iopub => self.iopub_port = port,
        }
    }

    /// The message signer for this connection's key.
    pub fn signer(&self) -> Result<Signer, ConfigError> {
        if self.key.is_empty() {
            return Ok(Signer::disabled());
        }
        match self.signature_scheme.as_str() {
            "hmac-sha256" => Ok(Signer::new(&self.key)?),
            other => Err(ConfigError::UnsupportedSignatureScheme(other.to_string())),
        }
    }
}

/// Which transport binding the kernel serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One TCP socket per channel, from the connection file.
    #[default]
    Physical,
    /// One TCP listener carrying all channels.
    Shared,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Physical => f.write_str("physical"),
            TransportKind::Shared => f.write_str("shared"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "physical" => Ok(TransportKind::Physical),
            "shared" => Ok(TransportKind::Shared),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// What a queued channel does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the inbound message and log a warning.
    #[default]
    Drop,
    /// Keep every message. Overflow waits in a backlog that feeds the queue
    /// as the consumer makes room, so the I/O thread never waits.
    Block,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Drop => f.write_str("drop"),
            OverflowPolicy::Block => f.write_str("block"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(OverflowPolicy::Drop),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Settings for the queued channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Everything needed to start a kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub transport: TransportKind,
    /// Ports and key for the physical binding.
    pub connection: ConnectionInfo,
    /// Listen address for the shared binding.
    pub listen: SocketAddr,
    pub queue: QueueConfig,
    pub substitution: SubstitutionMode,
    pub capture: CaptureConfig,
    pub max_frame_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            connection: ConnectionInfo::ephemeral("127.0.0.1"),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            queue: QueueConfig::default(),
            substitution: SubstitutionMode::default(),
            capture: CaptureConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.transport == TransportKind::Physical {
            self.connection.validate()?;
        }
        Ok(())
    }
}
