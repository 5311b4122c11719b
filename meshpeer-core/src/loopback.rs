//! In-process transport: any number of session managers sharing one `LoopbackNetwork`.
//! Events are delivered synchronously on the calling thread.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{TransferError, TransportError};
use crate::identity::{PeerId, PeerIdentity};
use crate::session::ConnectionState;
use crate::transfer::{ResourceProgress, SendMode};
use crate::transport::{Transport, TransportBinding, TransportEvent, TransportEvents};

struct Endpoint {
    binding: TransportBinding,
    advertising: bool,
    browsing: bool,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerId, Endpoint>,
    /// Undirected links, stored as (smaller, larger).
    links: HashSet<(PeerId, PeerId)>,
    download_dir: Option<PathBuf>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

type Target = Weak<dyn TransportEvents>;

fn deliver(target: &Target, event: TransportEvent) {
    if let Some(events) = target.upgrade() {
        events.deliver(event);
    }
}

impl Hub {
    fn target(&self, id: &PeerId) -> Option<Target> {
        self.endpoints.get(id).map(|e| e.binding.events.clone())
    }

    fn identity(&self, id: &PeerId) -> Option<PeerIdentity> {
        self.endpoints.get(id).map(|e| e.binding.local.clone())
    }

    fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&link_key(a, b))
    }

    /// Endpoints other than `me` in the same service namespace.
    fn neighbours<'a>(&'a self, me: &'a Endpoint) -> impl Iterator<Item = &'a Endpoint> + 'a {
        self.endpoints.values().filter(move |e| {
            e.binding.local != me.binding.local && e.binding.service_type == me.binding.service_type
        })
    }
}

/// Shared medium for loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where received resources are copied. Defaults to a directory under the system temp dir.
    pub fn with_download_dir(dir: impl Into<PathBuf>) -> Self {
        let net = Self::default();
        net.lock().download_dir = Some(dir.into());
        net
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new, unattached transport on this network.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            local: Mutex::new(None),
        }
    }

    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.lock().is_linked(a.id(), b.id())
    }

    /// Drop the link between two peers as if they went out of range. Both sides see `NotConnected`.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let (ta, tb) = {
            let mut hub = self.lock();
            if !hub.links.remove(&link_key(a.id(), b.id())) {
                return;
            }
            (hub.target(&a.id()), hub.target(&b.id()))
        };
        if let Some(t) = ta {
            deliver(&t, state_changed(b.clone(), ConnectionState::NotConnected));
        }
        if let Some(t) = tb {
            deliver(&t, state_changed(a.clone(), ConnectionState::NotConnected));
        }
    }

    fn download_dir(&self) -> PathBuf {
        self.lock()
            .download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("meshpeer-loopback"))
    }
}

fn state_changed(peer: PeerIdentity, state: ConnectionState) -> TransportEvent {
    TransportEvent::StateChanged { peer, state }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local: Mutex<Option<PeerIdentity>>,
}

impl LoopbackTransport {
    fn local(&self) -> Option<PeerIdentity> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver an opaque byte stream to a linked peer.
    pub fn open_stream(&self, peer: &PeerIdentity, name: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let me = self.local().ok_or(TransportError::ChannelClosed)?;
        let target = {
            let hub = self.network.lock();
            if !hub.is_linked(me.id(), peer.id()) {
                return Err(TransportError::SendFailed(format!("no link to {peer}")));
            }
            hub.target(&peer.id())
        };
        if let Some(t) = target {
            deliver(
                &t,
                TransportEvent::StreamReceived {
                    from: me,
                    name: name.to_string(),
                    stream: Box::new(std::io::Cursor::new(bytes)),
                },
            );
        }
        Ok(())
    }

    fn set_role(&self, advertising: Option<bool>, browsing: Option<bool>) {
        let Some(me) = self.local() else { return };
        let mut found_by_others: Vec<Target> = Vec::new();
        let mut lost_by_others: Vec<Target> = Vec::new();
        let mut found_by_me: Vec<TransportEvent> = Vec::new();
        let my_target;
        let my_info;
        {
            let mut hub = self.network.lock();
            let Some(endpoint) = hub.endpoints.get_mut(&me.id()) else {
                return;
            };
            let was_advertising = endpoint.advertising;
            let was_browsing = endpoint.browsing;
            if let Some(a) = advertising {
                endpoint.advertising = a;
            }
            if let Some(b) = browsing {
                endpoint.browsing = b;
            }
            my_target = endpoint.binding.events.clone();
            my_info = endpoint.binding.discovery_info.clone();
            let Some(endpoint) = hub.endpoints.get(&me.id()) else {
                return;
            };
            for other in hub.neighbours(endpoint) {
                if !other.browsing {
                    continue;
                }
                match (was_advertising, endpoint.advertising) {
                    (false, true) => found_by_others.push(other.binding.events.clone()),
                    (true, false) => lost_by_others.push(other.binding.events.clone()),
                    _ => {}
                }
            }
            if !was_browsing && endpoint.browsing {
                for other in hub.neighbours(endpoint).filter(|o| o.advertising) {
                    found_by_me.push(TransportEvent::PeerFound {
                        peer: other.binding.local.clone(),
                        info: other.binding.discovery_info.clone(),
                    });
                }
            }
        }
        for t in &found_by_others {
            deliver(
                t,
                TransportEvent::PeerFound {
                    peer: me.clone(),
                    info: my_info.clone(),
                },
            );
        }
        for t in &lost_by_others {
            deliver(t, TransportEvent::PeerLost { peer: me.clone() });
        }
        for event in found_by_me {
            deliver(&my_target, event);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Some(me) = self.local() {
            let mut hub = self.network.lock();
            hub.endpoints.remove(&me.id());
            hub.links.retain(|&(a, b)| a != me.id() && b != me.id());
        }
    }
}

impl Transport for LoopbackTransport {
    fn attach(&self, binding: TransportBinding) {
        *self.local.lock().unwrap_or_else(PoisonError::into_inner) = Some(binding.local.clone());
        self.network.lock().endpoints.insert(
            binding.local.id(),
            Endpoint {
                binding,
                advertising: false,
                browsing: false,
            },
        );
    }

    fn start_advertising(&self) {
        self.set_role(Some(true), None);
    }

    fn stop_advertising(&self) {
        self.set_role(Some(false), None);
    }

    fn start_browsing(&self) {
        self.set_role(None, Some(true));
    }

    fn stop_browsing(&self) {
        self.set_role(None, Some(false));
    }

    fn invite_peer(&self, peer: &PeerIdentity, context: Option<&[u8]>, timeout: Duration) {
        let Some(me) = self.local() else { return };
        let (my_target, their_target) = {
            let hub = self.network.lock();
            let Some(my_target) = hub.target(&me.id()) else {
                return;
            };
            let reachable = match (hub.endpoints.get(&me.id()), hub.endpoints.get(&peer.id())) {
                (Some(mine), Some(theirs)) => {
                    theirs.advertising && theirs.binding.service_type == mine.binding.service_type
                }
                _ => false,
            };
            (my_target, reachable.then(|| hub.target(&peer.id())).flatten())
        };
        let Some(their_target) = their_target else {
            tracing::debug!(%peer, "loopback invite to unreachable peer");
            deliver(&my_target, state_changed(peer.clone(), ConnectionState::NotConnected));
            return;
        };
        deliver(&my_target, state_changed(peer.clone(), ConnectionState::Connecting));

        let network = self.network.clone();
        let inviter = me.clone();
        let invitee = peer.clone();
        let deadline = Instant::now() + timeout;
        let respond = Box::new(move |accepted: bool| {
            let in_time = Instant::now() <= deadline;
            let (to_inviter, to_invitee) = {
                let mut hub = network.lock();
                if accepted && in_time {
                    hub.links.insert(link_key(inviter.id(), invitee.id()));
                }
                (hub.target(&inviter.id()), hub.target(&invitee.id()))
            };
            if accepted && in_time {
                if let Some(t) = &to_invitee {
                    deliver(t, state_changed(inviter.clone(), ConnectionState::Connected));
                }
                if let Some(t) = &to_inviter {
                    deliver(t, state_changed(invitee.clone(), ConnectionState::Connected));
                }
            } else if let Some(t) = &to_inviter {
                deliver(t, state_changed(invitee.clone(), ConnectionState::NotConnected));
            }
        });
        deliver(
            &their_target,
            TransportEvent::InvitationReceived {
                from: me,
                context: context.map(<[u8]>::to_vec),
                respond,
            },
        );
    }

    fn disconnect(&self) {
        let Some(me) = self.local() else { return };
        let mut notify: Vec<(Target, PeerIdentity)> = Vec::new();
        {
            let mut hub = self.network.lock();
            let others: Vec<PeerId> = hub
                .links
                .iter()
                .filter_map(|&(a, b)| match (a == me.id(), b == me.id()) {
                    (true, _) => Some(b),
                    (_, true) => Some(a),
                    _ => None,
                })
                .collect();
            hub.links.retain(|&(a, b)| a != me.id() && b != me.id());
            for other in others {
                if let (Some(t), Some(identity)) = (hub.target(&other), hub.identity(&other)) {
                    notify.push((t, me.clone()));
                    if let Some(mine) = hub.target(&me.id()) {
                        notify.push((mine, identity));
                    }
                }
            }
        }
        for (target, peer) in notify {
            deliver(&target, state_changed(peer, ConnectionState::NotConnected));
        }
    }

    fn send(&self, payload: &[u8], peers: &[PeerIdentity], _mode: SendMode) -> Result<(), TransportError> {
        let me = self.local().ok_or(TransportError::ChannelClosed)?;
        let targets: Vec<Target> = {
            let hub = self.network.lock();
            let mut targets = Vec::with_capacity(peers.len());
            for p in peers {
                match hub.target(&p.id()) {
                    Some(t) if hub.is_linked(me.id(), p.id()) => targets.push(t),
                    _ => return Err(TransportError::SendFailed(format!("no link to {p}"))),
                }
            }
            targets
        };
        for t in &targets {
            deliver(
                t,
                TransportEvent::DataReceived {
                    from: me.clone(),
                    payload: payload.to_vec(),
                },
            );
        }
        Ok(())
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
        progress: ResourceProgress,
    ) -> Result<(), TransportError> {
        let me = self.local().ok_or(TransportError::ChannelClosed)?;
        let target = {
            let hub = self.network.lock();
            if !hub.is_linked(me.id(), peer.id()) {
                return Err(TransportError::SendFailed(format!("no link to {peer}")));
            }
            hub.target(&peer.id()).ok_or(TransportError::ChannelClosed)?
        };
        let size = std::fs::metadata(path)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?
            .len();
        progress.set_total(size);

        deliver(
            &target,
            TransportEvent::ResourceStarted {
                from: me.clone(),
                name: name.to_string(),
                progress: ResourceProgress::new(size),
            },
        );
        let dir = self.network.download_dir();
        let dest = dir.join(uuid::Uuid::new_v4().to_string());
        let result = std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::copy(path, &dest))
            .map(|_| dest)
            .map_err(TransferError::from);
        if result.is_ok() {
            progress.advance_to(size);
            deliver(
                &target,
                TransportEvent::ResourceProgressed {
                    from: me.clone(),
                    name: name.to_string(),
                    completed: size,
                },
            );
        }
        deliver(
            &target,
            TransportEvent::ResourceFinished {
                from: me,
                name: name.to_string(),
                result,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::discovery::DiscoveryInfo;
    use crate::events::recording::{Event, RecordingSink};
    use crate::manager::{Role, SessionManager};
    use crate::transfer::TransferOutcome;

    type Manager = SessionManager<LoopbackTransport>;

    fn peer(net: &LoopbackNetwork, service: &str, name: &str, sink: RecordingSink) -> (Arc<Manager>, Arc<RecordingSink>) {
        peer_with(net, SessionConfig::new(service, name), sink)
    }

    fn peer_with(net: &LoopbackNetwork, config: SessionConfig, sink: RecordingSink) -> (Arc<Manager>, Arc<RecordingSink>) {
        let sink = Arc::new(sink);
        let manager = SessionManager::new(config, net.transport(), sink.clone()).unwrap();
        (manager, sink)
    }

    #[test]
    fn chat_demo_scenario() {
        let net = LoopbackNetwork::new();
        let (a, a_sink) = peer(&net, "chat-demo", "A", RecordingSink::answering(true));
        let mut b_config = SessionConfig::new("chat-demo", "B");
        let mut room = DiscoveryInfo::new();
        room.insert("room".into(), "1".into());
        b_config.discovery_info = Some(room.clone());
        let (b, b_sink) = peer_with(&net, b_config, RecordingSink::default());

        a.start(Role::NewConnections);
        b.start(Role::NewConnections);
        assert_eq!(a.visible_peers(), vec![b.local_peer().clone()]);
        assert!(a_sink
            .events()
            .contains(&Event::Found(b.local_peer().clone(), Some(room))));

        b.invite(a.local_peer());
        assert_eq!(a.connected_peers(), vec![b.local_peer().clone()]);
        assert_eq!(b.connected_peers(), vec![a.local_peer().clone()]);

        a.send_to_all(b"\x01\x02").unwrap();
        assert!(b_sink
            .events()
            .contains(&Event::Data(a.local_peer().clone(), vec![1, 2])));

        net.sever(a.local_peer(), b.local_peer());
        assert!(b.connected_peers().is_empty());
        assert!(!b.is_connected(a.local_peer()));
        assert_eq!(
            b_sink.events().last(),
            Some(&Event::Disconnected(a.local_peer().clone()))
        );
    }

    #[test]
    fn service_types_are_isolated() {
        let net = LoopbackNetwork::new();
        let (a, _) = peer(&net, "chat-demo", "A", RecordingSink::default());
        let (b, _) = peer(&net, "other-app", "B", RecordingSink::default());
        a.start(Role::NewConnections);
        b.start(Role::NewConnections);
        assert!(a.visible_peers().is_empty());
        assert!(b.visible_peers().is_empty());
    }

    #[test]
    fn stop_advertising_reports_lost_to_browsers() {
        let net = LoopbackNetwork::new();
        let (a, a_sink) = peer(&net, "chat-demo", "A", RecordingSink::default());
        let (b, _) = peer(&net, "chat-demo", "B", RecordingSink::default());
        a.start(Role::Browsing);
        b.start(Role::Advertising);
        assert_eq!(a.visible_peers().len(), 1);
        b.stop(Role::Advertising);
        assert!(a.visible_peers().is_empty());
        assert_eq!(
            a_sink.events().last(),
            Some(&Event::Lost(b.local_peer().clone()))
        );
    }

    #[test]
    fn rejected_invite_leaves_both_unconnected() {
        let net = LoopbackNetwork::new();
        let (a, _) = peer(&net, "chat-demo", "A", RecordingSink::answering(false));
        let (b, b_sink) = peer(&net, "chat-demo", "B", RecordingSink::default());
        a.start(Role::Advertising);
        b.invite(a.local_peer());
        assert_eq!(b.num_connected(), 0);
        assert_eq!(a.num_connected(), 0);
        assert!(!b_sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::Connected(_))));
    }

    #[test]
    fn late_decision_has_no_effect() {
        let net = LoopbackNetwork::new();
        let (a, a_sink) = peer(&net, "chat-demo", "A", RecordingSink::default());
        let (b, _) = peer(&net, "chat-demo", "B", RecordingSink::default());
        a.start(Role::Advertising);
        b.invite_with_timeout(a.local_peer(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        let decision = a_sink.decisions.lock().unwrap().pop().unwrap();
        decision.accept().unwrap();
        assert_eq!(a.num_connected(), 0);
        assert_eq!(b.num_connected(), 0);
    }

    #[test]
    fn disconnect_all_reports_both_sides() {
        let net = LoopbackNetwork::new();
        let (a, a_sink) = peer(&net, "chat-demo", "A", RecordingSink::answering(true));
        let (b, b_sink) = peer(&net, "chat-demo", "B", RecordingSink::answering(true));
        let (c, _) = peer(&net, "chat-demo", "C", RecordingSink::default());
        a.start(Role::NewConnections);
        b.start(Role::NewConnections);
        c.start(Role::NewConnections);
        c.invite(a.local_peer());
        c.invite(b.local_peer());
        assert_eq!(c.num_connected(), 2);

        c.stop(Role::AllConnections);
        assert_eq!(c.num_connected(), 0);
        assert_eq!(a.num_connected(), 0);
        assert!(a_sink
            .events()
            .contains(&Event::Disconnected(c.local_peer().clone())));
        assert!(b_sink
            .events()
            .contains(&Event::Disconnected(c.local_peer().clone())));
        assert!(!c.is_advertising() && !c.is_browsing());
    }

    #[test]
    fn resource_and_stream_delivery() {
        let dir = std::env::temp_dir().join(format!("meshpeer-test-{}", uuid::Uuid::new_v4()));
        let net = LoopbackNetwork::with_download_dir(dir.join("in"));
        let (a, _) = peer(&net, "chat-demo", "A", RecordingSink::answering(true));
        let (b, b_sink) = peer(&net, "chat-demo", "B", RecordingSink::default());
        a.start(Role::Advertising);
        b.invite(a.local_peer());

        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("note.txt");
        std::fs::write(&src, b"hello mesh").unwrap();
        let progress = a.send_resource(&src, "note.txt", b.local_peer()).unwrap();
        assert_eq!(progress.completed(), 10);
        assert_eq!(progress.fraction(), 1.0);

        let record = b.transfer(a.local_peer(), "note.txt").unwrap();
        let TransferOutcome::Succeeded(path) = &record.outcome else {
            panic!("expected success, got {:?}", record.outcome);
        };
        assert_eq!(std::fs::read(path).unwrap(), b"hello mesh");
        assert_eq!(record.progress.completed(), 10);

        a.transport()
            .open_stream(b.local_peer(), "live", vec![4, 2])
            .unwrap();
        assert!(b_sink.events().contains(&Event::Stream(
            a.local_peer().clone(),
            "live".into(),
            vec![4, 2]
        )));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
