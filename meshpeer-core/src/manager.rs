//! Host-facing API: `SessionManager` owns the session bookkeeping and the
//! transport handle. The transport pushes events in; the application drives
//! discovery, invitations and sends.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::discovery::{DiscoveryEntry, DiscoveryInfo, DiscoveryRegistry};
use crate::error::{ConfigError, SendError, TransferError, TransportError};
use crate::events::{EventSink, InboundStream};
use crate::identity::PeerIdentity;
use crate::invitation::{InvitationCoordinator, InvitationDecision};
use crate::session::{ConnectionState, SessionChange, SessionState};
use crate::transfer::{self, ResourceProgress, SendMode, TransferRecord, TransferTable};
use crate::transport::{InvitationResponder, Transport, TransportBinding, TransportEvent, TransportEvents};

/// What to start or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Advertising,
    Browsing,
    /// Advertising and browsing.
    NewConnections,
    /// Starts like `NewConnections`; stopping it also disconnects the session.
    AllConnections,
}

impl Role {
    fn discovery_roles(self) -> (bool, bool) {
        match self {
            Role::Advertising => (true, false),
            Role::Browsing => (false, true),
            Role::NewConnections | Role::AllConnections => (true, true),
        }
    }
}

/// All mutable state, behind one lock.
#[derive(Default)]
struct State {
    discovery: DiscoveryRegistry,
    session: SessionState,
    invitations: InvitationCoordinator,
    transfers: TransferTable,
    advertising: bool,
    browsing: bool,
}

/// Peer-to-peer session manager for one local identity.
///
/// Sink callbacks run after the state lock is released, so the sink may call
/// back into the manager (invite, send, query) from inside a callback.
pub struct SessionManager<T: Transport> {
    local: PeerIdentity,
    config: SessionConfig,
    transport: T,
    sink: Arc<dyn EventSink>,
    state: Mutex<State>,
}

impl<T: Transport + 'static> SessionManager<T> {
    /// Validate `config`, create a fresh local identity and attach the transport.
    pub fn new(config: SessionConfig, transport: T, sink: Arc<dyn EventSink>) -> Result<Arc<Self>, ConfigError> {
        let local = PeerIdentity::new(config.display_name.clone());
        Self::with_identity(config, local, transport, sink)
    }

    /// Like `new`, but with a caller-supplied local identity.
    pub fn with_identity(
        config: SessionConfig,
        local: PeerIdentity,
        transport: T,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let discovery = match config.discovery_staleness() {
            Some(window) => DiscoveryRegistry::with_staleness(window),
            None => DiscoveryRegistry::new(),
        };
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
            let events: Weak<dyn TransportEvents> = weak.clone();
            transport.attach(TransportBinding {
                local: local.clone(),
                service_type: config.service_type.clone(),
                discovery_info: config.discovery_info.clone(),
                events,
            });
            Self {
                local,
                config,
                transport,
                sink,
                state: Mutex::new(State {
                    discovery,
                    ..State::default()
                }),
            }
        });
        tracing::debug!(local = %manager.local, service = %manager.config.service_type, "session manager created");
        Ok(manager)
    }
}

impl<T: Transport> SessionManager<T> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // Starting and stopping

    pub fn start(&self, role: Role) {
        let (advertise, browse) = role.discovery_roles();
        {
            let mut st = self.lock();
            st.advertising |= advertise;
            st.browsing |= browse;
        }
        tracing::debug!(?role, "start");
        if advertise {
            self.transport.start_advertising();
        }
        if browse {
            self.transport.start_browsing();
        }
    }

    /// Stop discovery roles. Already-recorded discovery entries stay until a lost event.
    pub fn stop(&self, role: Role) {
        let (advertise, browse) = role.discovery_roles();
        {
            let mut st = self.lock();
            if advertise {
                st.advertising = false;
            }
            if browse {
                st.browsing = false;
            }
        }
        tracing::debug!(?role, "stop");
        if advertise {
            self.transport.stop_advertising();
        }
        if browse {
            self.transport.stop_browsing();
        }
        if role == Role::AllConnections {
            self.transport.disconnect();
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.lock().advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.lock().browsing
    }

    // Queries

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.lock().session.connected_peers()
    }

    pub fn num_connected(&self) -> usize {
        self.lock().session.len()
    }

    pub fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.lock().session.is_connected(&peer.id())
    }

    /// `Connecting` while an outbound invite to a not-yet-connected peer is pending.
    pub fn connection_state(&self, peer: &PeerIdentity) -> ConnectionState {
        let st = self.lock();
        match st.session.state_of(&peer.id()) {
            ConnectionState::NotConnected if st.invitations.is_pending(&peer.id()) => {
                ConnectionState::Connecting
            }
            state => state,
        }
    }

    pub fn visible_peers(&self) -> Vec<PeerIdentity> {
        self.lock().discovery.visible()
    }

    pub fn discovery_entry(&self, peer: &PeerIdentity) -> Option<DiscoveryEntry> {
        self.lock().discovery.get(&peer.id()).cloned()
    }

    pub fn transfer(&self, from: &PeerIdentity, name: &str) -> Option<TransferRecord> {
        self.lock().transfers.get(&from.id(), name).cloned()
    }

    /// Remove a finished (or abandoned) transfer record.
    pub fn take_transfer(&self, from: &PeerIdentity, name: &str) -> Option<TransferRecord> {
        self.lock().transfers.take(&from.id(), name)
    }

    pub fn in_flight_transfers(&self) -> Vec<TransferRecord> {
        self.lock().transfers.in_flight()
    }

    // Sending

    /// Send with the configured mode. Fails without sending if any target is not connected.
    pub fn send(&self, data: &[u8], peers: &[PeerIdentity]) -> Result<(), SendError> {
        self.send_with_mode(data, peers, self.config.send_mode)
    }

    pub fn send_with_mode(&self, data: &[u8], peers: &[PeerIdentity], mode: SendMode) -> Result<(), SendError> {
        transfer::validate_targets(&self.lock().session, peers)?;
        if peers.is_empty() {
            return Ok(());
        }
        self.transport.send(data, peers, mode)?;
        Ok(())
    }

    /// Send to every connected peer. No peers is a successful zero-recipient send.
    pub fn send_to_all(&self, data: &[u8]) -> Result<(), SendError> {
        let peers = self.connected_peers();
        if peers.is_empty() {
            tracing::debug!("send_to_all with no connected peers");
            return Ok(());
        }
        self.transport.send(data, &peers, self.config.send_mode)?;
        Ok(())
    }

    /// Start sending a file to one connected peer. Returns the sender-side progress.
    pub fn send_resource(&self, path: &Path, name: &str, peer: &PeerIdentity) -> Result<ResourceProgress, SendError> {
        transfer::validate_targets(&self.lock().session, std::slice::from_ref(peer))?;
        let progress = ResourceProgress::new(0);
        self.transport
            .send_resource(path, name, peer, progress.clone())?;
        Ok(progress)
    }

    // Inviting

    /// Invite with the configured timeout. Fire-and-forget.
    pub fn invite(&self, peer: &PeerIdentity) {
        self.invite_inner(peer, None, self.config.invite_timeout());
    }

    pub fn invite_with_timeout(&self, peer: &PeerIdentity, timeout: Duration) {
        self.invite_inner(peer, None, timeout);
    }

    pub fn invite_with_context(&self, peer: &PeerIdentity, context: &[u8]) {
        self.invite_inner(peer, Some(context), self.config.invite_timeout());
    }

    fn invite_inner(&self, peer: &PeerIdentity, context: Option<&[u8]>, timeout: Duration) {
        self.lock()
            .invitations
            .begin(peer.clone(), timeout, Instant::now());
        tracing::debug!(%peer, ?timeout, "inviting");
        self.transport.invite_peer(peer, context, timeout);
    }

    /// Forget outbound invites past their deadline. Returns the affected peers.
    pub fn expire_invitations(&self) -> Vec<PeerIdentity> {
        self.lock()
            .invitations
            .expire(Instant::now())
            .into_iter()
            .map(|p| p.peer)
            .collect()
    }

    /// Apply the staleness window (if configured), emitting lost for each evicted peer.
    pub fn evict_stale_peers(&self) -> Vec<PeerIdentity> {
        let evicted: Vec<PeerIdentity> = self
            .lock()
            .discovery
            .evict_stale(Instant::now())
            .into_iter()
            .map(|e| e.identity)
            .collect();
        for peer in &evicted {
            tracing::debug!(%peer, "discovery entry went stale");
            self.sink.lost_peer(peer);
        }
        evicted
    }

    // Transport callbacks

    pub fn on_peer_found(&self, peer: PeerIdentity, info: Option<DiscoveryInfo>) {
        {
            let mut st = self.lock();
            if !st.browsing {
                tracing::debug!(%peer, "found while not browsing; dropped");
                return;
            }
            st.discovery.on_found(peer.clone(), info.clone(), Instant::now());
        }
        self.sink.found_peer(&peer, info.as_ref());
    }

    pub fn on_peer_lost(&self, peer: PeerIdentity) {
        self.lock().discovery.on_lost(&peer.id());
        self.sink.lost_peer(&peer);
    }

    pub fn on_state_changed(&self, peer: PeerIdentity, state: ConnectionState) {
        let change = {
            let mut st = self.lock();
            let change = st.session.apply(peer.clone(), state);
            if change.is_some() {
                st.invitations.resolve(&peer.id());
            }
            change
        };
        match change {
            Some(SessionChange::Connected(peer)) => {
                tracing::debug!(%peer, "connected");
                self.sink.connected_to_peer(&peer);
            }
            Some(SessionChange::Disconnected { peer, was_member }) => {
                tracing::debug!(%peer, was_member, "disconnected");
                self.sink.disconnected_from_peer(&peer);
            }
            None => tracing::trace!(%peer, ?state, "state absorbed"),
        }
    }

    pub fn on_invitation_received(&self, from: PeerIdentity, context: Option<Vec<u8>>, respond: InvitationResponder) {
        let decision = InvitationDecision::new(from.clone(), respond);
        self.sink
            .received_invite(&from, context.as_deref(), decision);
    }

    pub fn on_data_received(&self, from: PeerIdentity, payload: Vec<u8>) {
        self.sink.did_receive_data(&payload, &from);
    }

    pub fn on_stream_received(&self, from: PeerIdentity, name: String, stream: InboundStream) {
        self.sink.did_receive_stream(stream, &name, &from);
    }

    pub fn on_resource_started(&self, from: PeerIdentity, name: String, progress: ResourceProgress) {
        self.lock()
            .transfers
            .started(from.clone(), &name, progress.clone());
        self.sink
            .did_start_receiving_resource(&name, &from, &progress);
    }

    pub fn on_resource_progressed(&self, from: PeerIdentity, name: String, completed: u64) {
        self.lock()
            .transfers
            .progressed(&from.id(), &name, completed);
    }

    pub fn on_resource_finished(
        &self,
        from: PeerIdentity,
        name: String,
        result: Result<PathBuf, TransferError>,
    ) {
        let known = self
            .lock()
            .transfers
            .finished(&from.id(), &name, result.clone())
            .is_some();
        if !known {
            tracing::debug!(%from, %name, "finish for a transfer that never started; forwarding");
        }
        self.sink
            .did_finish_receiving_resource(&name, &from, result.as_deref());
    }

    pub fn on_advertising_failed(&self, reason: String) {
        self.lock().advertising = false;
        tracing::warn!(%reason, "advertising failed to start");
        self.sink
            .encountered_error(&TransportError::AdvertisingFailed(reason));
    }

    pub fn on_browsing_failed(&self, reason: String) {
        self.lock().browsing = false;
        tracing::warn!(%reason, "browsing failed to start");
        self.sink
            .encountered_error(&TransportError::BrowsingFailed(reason));
    }

    pub fn on_transport_error(&self, error: TransportError) {
        tracing::warn!(%error, "transport error");
        self.sink.encountered_error(&error);
    }

    /// Dispatch one transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, info } => self.on_peer_found(peer, info),
            TransportEvent::PeerLost { peer } => self.on_peer_lost(peer),
            TransportEvent::StateChanged { peer, state } => self.on_state_changed(peer, state),
            TransportEvent::InvitationReceived {
                from,
                context,
                respond,
            } => self.on_invitation_received(from, context, respond),
            TransportEvent::DataReceived { from, payload } => self.on_data_received(from, payload),
            TransportEvent::StreamReceived { from, name, stream } => {
                self.on_stream_received(from, name, stream)
            }
            TransportEvent::ResourceStarted {
                from,
                name,
                progress,
            } => self.on_resource_started(from, name, progress),
            TransportEvent::ResourceProgressed {
                from,
                name,
                completed,
            } => self.on_resource_progressed(from, name, completed),
            TransportEvent::ResourceFinished { from, name, result } => {
                self.on_resource_finished(from, name, result)
            }
            TransportEvent::AdvertisingFailed(reason) => self.on_advertising_failed(reason),
            TransportEvent::BrowsingFailed(reason) => self.on_browsing_failed(reason),
            TransportEvent::Error(error) => self.on_transport_error(error),
        }
    }
}

impl<T: Transport> TransportEvents for SessionManager<T> {
    fn deliver(&self, event: TransportEvent) {
        self.handle_event(event);
    }
}
