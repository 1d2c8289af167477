//! Per-run record of one participant.

use crate::error::PeerFault;
use crate::phase::Phase;
use crate::types::PeerId;
use std::collections::BTreeMap;

/// A participant inside a single run.
///
/// Owned by exactly one run. Retries build new records through [`Peer::fresh`], which
/// carries the identity forward and nothing else.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    messages: BTreeMap<Phase, Vec<u8>>,
    faults: Vec<PeerFault>,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            messages: BTreeMap::new(),
            faults: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Stores the payload for `phase`. Messages for phases ahead of `current` are kept
    /// until the run gets there.
    pub fn record_message(
        &mut self,
        phase: Phase,
        payload: Vec<u8>,
        current: Phase,
    ) -> Result<(), PeerFault> {
        if phase < current {
            return Err(PeerFault::UnexpectedPhase { phase, current });
        }
        if self.messages.contains_key(&phase) {
            return Err(PeerFault::DuplicateMessage { phase });
        }
        self.messages.insert(phase, payload);
        Ok(())
    }

    pub fn message(&self, phase: Phase) -> Option<&[u8]> {
        self.messages.get(&phase).map(Vec::as_slice)
    }

    pub fn has_submitted(&self, phase: Phase) -> bool {
        self.messages.contains_key(&phase)
    }

    /// Flags the peer. Once set the flag stays for the rest of the run; repeated reports
    /// only add reasons.
    pub fn mark_misbehaving(&mut self, fault: PeerFault) {
        if !self.faults.contains(&fault) {
            self.faults.push(fault);
        }
    }

    pub fn is_misbehaving(&self) -> bool {
        !self.faults.is_empty()
    }

    pub fn faults(&self) -> &[PeerFault] {
        &self.faults
    }

    /// Record for the next epoch.
    pub fn fresh(&self) -> Peer {
        Peer::new(self.id)
    }
}
