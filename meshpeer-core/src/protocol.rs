//! LAN wire protocol spoken by the reference host: message types and version.

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryInfo;
use crate::identity::PeerIdentity;

/// Current protocol version. Carried in every beacon.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Multicast advertisement.
    Beacon {
        protocol_version: u8,
        service_type: String,
        peer: PeerIdentity,
        info: Option<DiscoveryInfo>,
        listen_port: u16,
    },
    /// Multicast: advertiser stopped.
    Goodbye {
        service_type: String,
        peer: PeerIdentity,
    },
    /// First frame on a new link.
    Invite {
        peer: PeerIdentity,
        context: Option<Vec<u8>>,
    },
    /// Invitee's answer. A link stays open only after `accepted: true`.
    InviteResponse {
        accepted: bool,
    },
    /// Application payload.
    Data {
        payload: Vec<u8>,
    },
    ResourceStart {
        name: String,
        total: u64,
    },
    ResourceChunk {
        name: String,
        bytes: Vec<u8>,
    },
    ResourceEnd {
        name: String,
    },
    ResourceAbort {
        name: String,
        reason: String,
    },
    /// Graceful link close.
    Leave,
}
