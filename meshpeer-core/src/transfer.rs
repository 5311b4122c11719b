//! Data delivery bookkeeping: send-target validation and inbound resource transfers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{SendError, TransferError};
use crate::identity::{PeerId, PeerIdentity};
use crate::session::SessionState;

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    #[default]
    Reliable,
    Unreliable,
}

#[derive(Debug, Default)]
struct ProgressInner {
    completed: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
}

/// Byte progress of one resource transfer, shared between transport, core and application.
/// The transport drives it; everyone else reads.
#[derive(Debug, Clone, Default)]
pub struct ResourceProgress {
    inner: Arc<ProgressInner>,
}

impl ResourceProgress {
    /// `total` of 0 means unknown.
    pub fn new(total: u64) -> Self {
        let p = Self::default();
        p.set_total(total);
        p
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::Release);
    }

    /// Move progress forward to `bytes`. Never goes backwards.
    pub fn advance_to(&self, bytes: u64) {
        self.inner.completed.fetch_max(bytes, Ordering::AcqRel);
    }

    /// Completion in `0.0..=1.0`; 0.0 while the total is unknown.
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.completed() as f64 / total as f64).min(1.0)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    InFlight,
    Succeeded(PathBuf),
    Failed(TransferError),
}

impl TransferOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferOutcome::InFlight)
    }
}

/// One inbound resource, keyed by (sender, name).
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub name: String,
    pub sender: PeerIdentity,
    pub progress: ResourceProgress,
    pub outcome: TransferOutcome,
}

/// Inbound resource transfers. Records stay until the application takes them.
#[derive(Debug, Default)]
pub struct TransferTable {
    records: HashMap<(PeerId, String), TransferRecord>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record. A new start for the same (sender, name) replaces the old one.
    pub fn started(&mut self, sender: PeerIdentity, name: &str, progress: ResourceProgress) {
        let key = (sender.id(), name.to_string());
        if let Some(old) = self.records.get(&key) {
            if !old.outcome.is_terminal() {
                tracing::warn!(peer = %sender, name, "restarted an in-flight transfer");
            }
        }
        self.records.insert(
            key,
            TransferRecord {
                name: name.to_string(),
                sender,
                progress,
                outcome: TransferOutcome::InFlight,
            },
        );
    }

    /// Relay a progress report. Ignored for unknown or finished transfers.
    pub fn progressed(&mut self, sender: &PeerId, name: &str, bytes: u64) {
        if let Some(rec) = self.records.get(&(*sender, name.to_string())) {
            if !rec.outcome.is_terminal() {
                rec.progress.advance_to(bytes);
            }
        }
    }

    /// Move the record to its terminal state. Only the first finish counts.
    /// Returns the stored record, or `None` if the transfer was never started.
    pub fn finished(
        &mut self,
        sender: &PeerId,
        name: &str,
        result: Result<PathBuf, TransferError>,
    ) -> Option<TransferRecord> {
        let rec = self.records.get_mut(&(*sender, name.to_string()))?;
        if rec.outcome.is_terminal() {
            tracing::warn!(peer = %rec.sender, name, "duplicate finish for transfer");
            return Some(rec.clone());
        }
        rec.outcome = match result {
            Ok(path) => {
                let total = rec.progress.total();
                if total > 0 {
                    rec.progress.advance_to(total);
                }
                TransferOutcome::Succeeded(path)
            }
            Err(e) => TransferOutcome::Failed(e),
        };
        Some(rec.clone())
    }

    pub fn get(&self, sender: &PeerId, name: &str) -> Option<&TransferRecord> {
        self.records.get(&(*sender, name.to_string()))
    }

    /// Dispose of a record.
    pub fn take(&mut self, sender: &PeerId, name: &str) -> Option<TransferRecord> {
        self.records.remove(&(*sender, name.to_string()))
    }

    pub fn in_flight(&self) -> Vec<TransferRecord> {
        self.records
            .values()
            .filter(|r| !r.outcome.is_terminal())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All targets must be connected; otherwise fail naming every offender.
pub fn validate_targets(session: &SessionState, targets: &[PeerIdentity]) -> Result<(), SendError> {
    let mut offenders: Vec<PeerIdentity> = Vec::new();
    for t in targets {
        if !session.is_connected(&t.id()) && !offenders.contains(t) {
            offenders.push(t.clone());
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(SendError::PeerNotConnected(offenders))
    }
}
