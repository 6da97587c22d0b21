use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five canonical kernel channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelName {
    #[serde(rename = "hb")]
    Heartbeat,
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "control")]
    Control,
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "iopub")]
    Iopub,
}

/// How a channel moves messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Inbound messages go through a bounded queue drained by a consumer thread.
    Queued,
    /// Inbound messages invoke callbacks on the transport's I/O thread.
    Immediate,
    /// Outbound only; inbound messages are ignored.
    Broadcast,
    /// Every inbound frame is sent back verbatim.
    Loopback,
}

impl ChannelName {
    pub const ALL: [ChannelName; 5] = [
        ChannelName::Heartbeat,
        ChannelName::Shell,
        ChannelName::Control,
        ChannelName::Stdin,
        ChannelName::Iopub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Heartbeat => "hb",
            ChannelName::Shell => "shell",
            ChannelName::Control => "control",
            ChannelName::Stdin => "stdin",
            ChannelName::Iopub => "iopub",
        }
    }

    /// The role a kernel gives this channel.
    ///
    /// stdin is immediate so an `input_reply` reaches an execution that is
    /// blocked on the shell consumer thread.
    pub fn role(&self) -> ChannelRole {
        match self {
            ChannelName::Heartbeat => ChannelRole::Loopback,
            ChannelName::Shell | ChannelName::Control => ChannelRole::Queued,
            ChannelName::Stdin => ChannelRole::Immediate,
            ChannelName::Iopub => ChannelRole::Broadcast,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}
