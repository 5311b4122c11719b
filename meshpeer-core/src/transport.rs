//! Boundary to the platform transport (radio, LAN sockets, loopback...).
//!
//! The core calls out through [`Transport`]; the transport calls back in by
//! delivering [`TransportEvent`]s to the [`TransportEvents`] it was attached to.

use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;

use crate::discovery::DiscoveryInfo;
use crate::error::{TransferError, TransportError};
use crate::events::InboundStream;
use crate::identity::PeerIdentity;
use crate::session::ConnectionState;
use crate::transfer::{ResourceProgress, SendMode};

/// One-shot answer to an inbound invitation, supplied by the transport.
pub type InvitationResponder = Box<dyn FnOnce(bool) + Send>;

/// Everything a transport needs to know about the session it serves.
#[derive(Clone)]
pub struct TransportBinding {
    pub local: PeerIdentity,
    pub service_type: String,
    pub discovery_info: Option<DiscoveryInfo>,
    pub events: Weak<dyn TransportEvents>,
}

/// Outbound controls. All calls are non-blocking handoffs.
pub trait Transport: Send + Sync {
    /// Called once by the manager during construction.
    fn attach(&self, binding: TransportBinding);

    fn start_advertising(&self);
    fn stop_advertising(&self);
    fn start_browsing(&self);
    fn stop_browsing(&self);

    /// Begin the handshake. Outcome arrives later as a state change.
    fn invite_peer(&self, peer: &PeerIdentity, context: Option<&[u8]>, timeout: Duration);

    /// Close every connection. Each closed link reports `NotConnected`.
    fn disconnect(&self);

    /// Deliver `payload` to every peer in `peers`, or to none.
    fn send(&self, payload: &[u8], peers: &[PeerIdentity], mode: SendMode) -> Result<(), TransportError>;

    /// Start sending a file. The transport drives `progress`.
    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
        progress: ResourceProgress,
    ) -> Result<(), TransportError> {
        let _ = (path, name, peer, progress);
        Err(TransportError::Unsupported("resource transfer"))
    }
}

/// Inbound callbacks from the transport.
pub enum TransportEvent {
    PeerFound {
        peer: PeerIdentity,
        info: Option<DiscoveryInfo>,
    },
    PeerLost {
        peer: PeerIdentity,
    },
    StateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    InvitationReceived {
        from: PeerIdentity,
        context: Option<Vec<u8>>,
        respond: InvitationResponder,
    },
    DataReceived {
        from: PeerIdentity,
        payload: Vec<u8>,
    },
    StreamReceived {
        from: PeerIdentity,
        name: String,
        stream: InboundStream,
    },
    ResourceStarted {
        from: PeerIdentity,
        name: String,
        progress: ResourceProgress,
    },
    ResourceProgressed {
        from: PeerIdentity,
        name: String,
        completed: u64,
    },
    ResourceFinished {
        from: PeerIdentity,
        name: String,
        result: Result<PathBuf, TransferError>,
    },
    AdvertisingFailed(String),
    BrowsingFailed(String),
    Error(TransportError),
}

/// Receiver of transport events (implemented by the session manager).
pub trait TransportEvents: Send + Sync {
    fn deliver(&self, event: TransportEvent);
}

#[cfg(test)]
pub(crate) mod recording {
    //! Transport double that records calls and lets tests inject events.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        StartAdvertising,
        StopAdvertising,
        StartBrowsing,
        StopBrowsing,
        Invite(PeerIdentity, Option<Vec<u8>>, Duration),
        Disconnect,
        Send(Vec<u8>, Vec<PeerIdentity>, SendMode),
        SendResource(PathBuf, String, PeerIdentity),
    }

    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<Call>>,
        pub binding: Mutex<Option<TransportBinding>>,
        pub fail_sends: Mutex<Option<TransportError>>,
    }

    impl RecordingTransport {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sends(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Send(..)))
                .collect()
        }

        /// Deliver an event the way a real transport would.
        pub fn inject(&self, event: TransportEvent) {
            let events = self
                .binding
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|b| b.events.upgrade());
            if let Some(events) = events {
                events.deliver(event);
            }
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Transport for Arc<RecordingTransport> {
        fn attach(&self, binding: TransportBinding) {
            *self.binding.lock().unwrap() = Some(binding);
        }
        fn start_advertising(&self) {
            self.record(Call::StartAdvertising);
        }
        fn stop_advertising(&self) {
            self.record(Call::StopAdvertising);
        }
        fn start_browsing(&self) {
            self.record(Call::StartBrowsing);
        }
        fn stop_browsing(&self) {
            self.record(Call::StopBrowsing);
        }
        fn invite_peer(&self, peer: &PeerIdentity, context: Option<&[u8]>, timeout: Duration) {
            self.record(Call::Invite(peer.clone(), context.map(<[u8]>::to_vec), timeout));
        }
        fn disconnect(&self) {
            self.record(Call::Disconnect);
        }
        fn send(&self, payload: &[u8], peers: &[PeerIdentity], mode: SendMode) -> Result<(), TransportError> {
            if let Some(e) = self.fail_sends.lock().unwrap().clone() {
                return Err(e);
            }
            self.record(Call::Send(payload.to_vec(), peers.to_vec(), mode));
            Ok(())
        }
        fn send_resource(
            &self,
            path: &Path,
            name: &str,
            peer: &PeerIdentity,
            _progress: ResourceProgress,
        ) -> Result<(), TransportError> {
            self.record(Call::SendResource(path.to_path_buf(), name.to_string(), peer.clone()));
            Ok(())
        }
    }
}
