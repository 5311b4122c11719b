//! Invitations: outbound attempts with a deadline, and the one-shot inbound decision.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::DecisionError;
use crate::identity::{PeerId, PeerIdentity};
use crate::transport::InvitationResponder;

/// Outbound invite awaiting a session-state change from the transport.
#[derive(Debug, Clone)]
pub struct PendingInvitation {
    pub peer: PeerIdentity,
    pub deadline: Instant,
}

/// Bookkeeping for outbound invites. The transport owns the real timeout;
/// this only lets the core answer "is an invite in flight" and prune old ones.
#[derive(Debug, Default)]
pub struct InvitationCoordinator {
    outbound: HashMap<PeerId, PendingInvitation>,
}

impl InvitationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invite. Re-inviting the same peer refreshes the deadline.
    pub fn begin(&mut self, peer: PeerIdentity, timeout: Duration, now: Instant) {
        let deadline = now + timeout;
        self.outbound
            .insert(peer.id(), PendingInvitation { peer, deadline });
    }

    /// Drop the pending entry once the transport reported a terminal state for the peer.
    pub fn resolve(&mut self, peer: &PeerId) -> Option<PendingInvitation> {
        self.outbound.remove(peer)
    }

    /// Remove and return invites whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingInvitation> {
        let overdue: Vec<PeerId> = self
            .outbound
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(&id, _)| id)
            .collect();
        overdue
            .into_iter()
            .filter_map(|id| self.outbound.remove(&id))
            .collect()
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.outbound.contains_key(peer)
    }

    pub fn pending(&self) -> Vec<PendingInvitation> {
        self.outbound.values().cloned().collect()
    }
}

struct DecisionInner {
    from: PeerIdentity,
    decided: AtomicBool,
    responder: Mutex<Option<InvitationResponder>>,
}

/// Accept/reject handle for an inbound invitation.
///
/// Cloneable and usable from any thread. Only the first call reaches the
/// transport; later calls fail with [`DecisionError::AlreadyDecided`].
/// Dropping every clone without deciding leaves the invite to the transport's timeout.
#[derive(Clone)]
pub struct InvitationDecision {
    inner: Arc<DecisionInner>,
}

impl InvitationDecision {
    pub fn new(from: PeerIdentity, responder: InvitationResponder) -> Self {
        Self {
            inner: Arc::new(DecisionInner {
                from,
                decided: AtomicBool::new(false),
                responder: Mutex::new(Some(responder)),
            }),
        }
    }

    pub fn from_peer(&self) -> &PeerIdentity {
        &self.inner.from
    }

    pub fn is_decided(&self) -> bool {
        self.inner.decided.load(Ordering::Acquire)
    }

    pub fn accept(&self) -> Result<(), DecisionError> {
        self.decide(true)
    }

    pub fn reject(&self) -> Result<(), DecisionError> {
        self.decide(false)
    }

    pub fn decide(&self, accept: bool) -> Result<(), DecisionError> {
        if self.inner.decided.swap(true, Ordering::AcqRel) {
            tracing::error!(peer = %self.inner.from, "invitation decision invoked twice; ignoring");
            return Err(DecisionError::AlreadyDecided(self.inner.from.to_string()));
        }
        let responder = self
            .inner
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(respond) = responder {
            tracing::debug!(peer = %self.inner.from, accept, "invitation decided");
            respond(accept);
        }
        Ok(())
    }
}

impl fmt::Debug for InvitationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationDecision")
            .field("from", &self.inner.from)
            .field("decided", &self.is_decided())
            .finish()
    }
}
