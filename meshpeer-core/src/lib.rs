//! Peer-to-peer session manager core.
//! Host-driven: the transport pushes events in, the core calls the transport out.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod invitation;
pub mod loopback;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use config::SessionConfig;
pub use discovery::{DiscoveryEntry, DiscoveryInfo, DiscoveryRegistry};
pub use error::{ConfigError, DecisionError, SendError, TransferError, TransportError};
pub use events::{EventSink, InboundStream};
pub use identity::{PeerId, PeerIdentity};
pub use invitation::{InvitationCoordinator, InvitationDecision};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::{Role, SessionManager};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{ConnectionState, SessionState};
pub use transfer::{ResourceProgress, SendMode, TransferOutcome, TransferRecord, TransferTable};
pub use transport::{InvitationResponder, Transport, TransportBinding, TransportEvent, TransportEvents};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
