//! Observer interface through which the core reports everything.
//!
//! Only `found_peer` and `lost_peer` must be implemented; every other
//! capability defaults to logging at debug level and doing nothing.

use std::path::Path;

use crate::discovery::DiscoveryInfo;
use crate::error::{TransferError, TransportError};
use crate::identity::PeerIdentity;
use crate::invitation::InvitationDecision;
use crate::transfer::ResourceProgress;

/// Opaque inbound byte stream handed over by the transport.
pub type InboundStream = Box<dyn std::io::Read + Send>;

/// Application-side observer. Called from whatever thread the transport delivers on,
/// never while the core holds its state lock, so implementations may call back into the manager.
pub trait EventSink: Send + Sync {
    fn found_peer(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>);

    fn lost_peer(&self, peer: &PeerIdentity);

    fn connected_to_peer(&self, peer: &PeerIdentity) {
        tracing::debug!(%peer, "connected_to_peer - not implemented");
    }

    fn disconnected_from_peer(&self, peer: &PeerIdentity) {
        tracing::debug!(%peer, "disconnected_from_peer - not implemented");
    }

    /// The application must eventually call `decision.accept()` or `decision.reject()`.
    fn received_invite(&self, from: &PeerIdentity, context: Option<&[u8]>, decision: InvitationDecision) {
        let _ = (context, decision);
        tracing::debug!(%from, "received_invite - not implemented");
    }

    fn did_receive_data(&self, data: &[u8], from: &PeerIdentity) {
        tracing::debug!(%from, len = data.len(), "did_receive_data - not implemented");
    }

    fn did_receive_stream(&self, stream: InboundStream, name: &str, from: &PeerIdentity) {
        drop(stream);
        tracing::debug!(%from, name, "did_receive_stream - not implemented");
    }

    fn did_start_receiving_resource(&self, name: &str, from: &PeerIdentity, progress: &ResourceProgress) {
        let _ = progress;
        tracing::debug!(%from, name, "did_start_receiving_resource - not implemented");
    }

    fn did_finish_receiving_resource(
        &self,
        name: &str,
        from: &PeerIdentity,
        result: Result<&Path, &TransferError>,
    ) {
        let _ = result;
        tracing::debug!(%from, name, "did_finish_receiving_resource - not implemented");
    }

    fn encountered_error(&self, error: &TransportError) {
        tracing::debug!(%error, "encountered_error - not implemented");
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Sink that records every event, for tests.

    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Found(PeerIdentity, Option<DiscoveryInfo>),
        Lost(PeerIdentity),
        Connected(PeerIdentity),
        Disconnected(PeerIdentity),
        Invite(PeerIdentity, Option<Vec<u8>>),
        Data(PeerIdentity, Vec<u8>),
        Stream(PeerIdentity, String, Vec<u8>),
        ResourceStarted(PeerIdentity, String),
        ResourceFinished(PeerIdentity, String, Result<PathBuf, TransferError>),
        Error(TransportError),
    }

    /// Records events; optionally answers invitations.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<Event>>,
        pub decisions: Mutex<Vec<InvitationDecision>>,
        pub auto_answer: Option<bool>,
    }

    impl RecordingSink {
        pub fn answering(accept: bool) -> Self {
            Self {
                auto_answer: Some(accept),
                ..Self::default()
            }
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.events.lock().unwrap().clear();
        }

        fn push(&self, e: Event) {
            self.events.lock().unwrap().push(e);
        }
    }

    impl EventSink for RecordingSink {
        fn found_peer(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) {
            self.push(Event::Found(peer.clone(), info.cloned()));
        }

        fn lost_peer(&self, peer: &PeerIdentity) {
            self.push(Event::Lost(peer.clone()));
        }

        fn connected_to_peer(&self, peer: &PeerIdentity) {
            self.push(Event::Connected(peer.clone()));
        }

        fn disconnected_from_peer(&self, peer: &PeerIdentity) {
            self.push(Event::Disconnected(peer.clone()));
        }

        fn received_invite(&self, from: &PeerIdentity, context: Option<&[u8]>, decision: InvitationDecision) {
            self.push(Event::Invite(from.clone(), context.map(<[u8]>::to_vec)));
            match self.auto_answer {
                Some(accept) => {
                    let _ = decision.decide(accept);
                }
                None => self.decisions.lock().unwrap().push(decision),
            }
        }

        fn did_receive_data(&self, data: &[u8], from: &PeerIdentity) {
            self.push(Event::Data(from.clone(), data.to_vec()));
        }

        fn did_receive_stream(&self, mut stream: InboundStream, name: &str, from: &PeerIdentity) {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            self.push(Event::Stream(from.clone(), name.to_string(), buf));
        }

        fn did_start_receiving_resource(&self, name: &str, from: &PeerIdentity, _progress: &ResourceProgress) {
            self.push(Event::ResourceStarted(from.clone(), name.to_string()));
        }

        fn did_finish_receiving_resource(
            &self,
            name: &str,
            from: &PeerIdentity,
            result: Result<&Path, &TransferError>,
        ) {
            let result = result.map(Path::to_path_buf).map_err(Clone::clone);
            self.push(Event::ResourceFinished(from.clone(), name.to_string(), result));
        }

        fn encountered_error(&self, error: &TransportError) {
            self.push(Event::Error(error.clone()));
        }
    }

    /// Implements only the two required methods.
    pub struct MinimalSink;

    impl EventSink for MinimalSink {
        fn found_peer(&self, _peer: &PeerIdentity, _info: Option<&DiscoveryInfo>) {}
        fn lost_peer(&self, _peer: &PeerIdentity) {}
    }
}
