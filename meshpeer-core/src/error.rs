//! Error types. Synchronous failures come back from the call; background
//! failures only ever reach the application through `EventSink::encountered_error`.

use crate::identity::PeerIdentity;

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("advertising could not start: {0}")]
    AdvertisingFailed(String),
    #[error("browsing could not start: {0}")]
    BrowsingFailed(String),
    #[error("send rejected: {0}")]
    SendFailed(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("operation not supported by transport: {0}")]
    Unsupported(&'static str),
}

/// Failure of `send` / `send_to_all` / `send_resource`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// At least one target is not connected. Nothing was handed to the transport.
    #[error("peer(s) not connected: {}", display_peers(.0))]
    PeerNotConnected(Vec<PeerIdentity>),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn display_peers(peers: &[PeerIdentity]) -> String {
    peers
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The inbound invitation decision was used more than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("invitation from {0} already decided")]
    AlreadyDecided(String),
}

/// Why a resource transfer ended without a local file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("peer disconnected mid-transfer")]
    PeerDisconnected,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}

/// Invalid session configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("service type must be 1-15 characters, got {0}")]
    ServiceTypeLength(usize),
    #[error("service type may only contain lowercase ASCII letters, digits and hyphens: {0:?}")]
    ServiceTypeCharset(String),
    #[error("service type hyphens must not lead, trail or repeat: {0:?}")]
    ServiceTypeHyphen(String),
    #[error("display name must be 1-63 bytes, got {0}")]
    DisplayNameLength(usize),
}
