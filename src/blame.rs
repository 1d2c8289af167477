//! Attribution of a failed run to the peers responsible for it.
//!
//! Blame is assigned in three passes over the run's record:
//!
//! 1. every peer flagged while the run was collecting messages,
//! 2. every peer that had not submitted for the phase whose deadline passed,
//! 3. every peer the collaborator implicated in a failed derivation. When it could not
//!    tell two peers apart, both are listed.

use crate::phase::{Phase, RunState};
use crate::run::{RunFailure, SessionRun};
use crate::types::{PeerId, SessionId};
use std::fmt;

/// Primary category of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlameReason {
    /// Malformed, duplicate or out-of-phase messages.
    Misbehavior,
    /// Missing messages at a phase deadline.
    Unresponsive,
    /// The combined payloads did not derive, e.g. a slot reservation collision or a
    /// confirmation mismatch.
    DerivationFault,
    /// Nothing attributable; retry the same participants.
    NoFault,
}

impl fmt::Display for BlameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlameReason::Misbehavior => "misbehavior",
            BlameReason::Unresponsive => "unresponsive",
            BlameReason::DerivationFault => "derivation fault",
            BlameReason::NoFault => "no fault",
        })
    }
}

/// Peers responsible for one failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameVerdict {
    pub session_id: SessionId,
    pub epoch: u32,
    pub phase: Phase,
    /// Flagged peers first, then unresponsive ones; no duplicates.
    pub blamed: Vec<PeerId>,
    pub reason: BlameReason,
}

impl BlameVerdict {
    pub fn is_empty(&self) -> bool {
        self.blamed.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.blamed.contains(peer)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlameAssigner;

impl BlameAssigner {
    /// Produces the verdict for a run in [`RunState::Blamed`], `None` for any other state.
    pub fn assign(&self, run: &SessionRun) -> Option<BlameVerdict> {
        if run.state() != RunState::Blamed {
            return None;
        }
        let failure = run.failure()?;
        let phase = failure.phase();
        let local = run.ctx().local;

        let mut blamed: Vec<PeerId> = run
            .peers()
            .filter(|peer| *peer.id() != local && peer.is_misbehaving())
            .map(|peer| *peer.id())
            .collect();
        let flagged = !blamed.is_empty();

        let mut unresponsive = false;
        if let RunFailure::Timeout { .. } = failure {
            let missing = run.missing(phase);
            let remote = run.peers().filter(|peer| *peer.id() != local).count();
            // Nobody got through at all: treat it as our own connectivity trouble.
            let silent = missing.len() == remote;
            if !missing.is_empty() && (flagged || !silent) {
                unresponsive = true;
                for peer in missing {
                    if !blamed.contains(&peer) {
                        blamed.push(peer);
                    }
                }
            }
        }

        let reason = match failure {
            RunFailure::Derivation { .. } if flagged => BlameReason::DerivationFault,
            _ if flagged => BlameReason::Misbehavior,
            _ if unresponsive => BlameReason::Unresponsive,
            _ => BlameReason::NoFault,
        };

        Some(BlameVerdict {
            session_id: run.session_id(),
            epoch: run.epoch(),
            phase,
            blamed,
            reason,
        })
    }
}
