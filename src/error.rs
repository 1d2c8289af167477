//! Error types for the mixing engine.
//!
//! Peer-attributable faults ([`PeerFault`]) are recorded against the offending peer and
//! never fail a run on their own. Everything a caller can observe directly is a
//! [`MixError`].

use crate::phase::Phase;
use crate::types::{OutputCommitment, PairRequestId, PeerId, SessionId};

/// A protocol fault attributable to one remote peer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerFault {
    #[error("duplicate {phase} message")]
    DuplicateMessage { phase: Phase },

    #[error("{phase} message arrived after the run advanced to {current}")]
    UnexpectedPhase { phase: Phase, current: Phase },

    #[error("malformed {phase} message: {reason}")]
    Malformed { phase: Phase, reason: String },

    #[error("implicated by {phase} derivation: {reason}")]
    Implicated { phase: Phase, reason: String },
}

impl PeerFault {
    pub fn phase(&self) -> Phase {
        match self {
            PeerFault::DuplicateMessage { phase }
            | PeerFault::UnexpectedPhase { phase, .. }
            | PeerFault::Malformed { phase, .. }
            | PeerFault::Implicated { phase, .. } => *phase,
        }
    }
}

/// Errors surfaced to the coordinator and the wallet.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    #[error("insufficient peers: have {have}, need {need}")]
    InsufficientPeers { have: usize, need: usize },

    #[error("output {0} is locked by an active run")]
    OutputLocked(OutputCommitment),

    #[error("output {0} is already offered by another pair request")]
    OutputConflict(OutputCommitment),

    #[error("pair request expired at height {expiry} (tip {tip})")]
    Expired { expiry: u32, tip: u32 },

    #[error("pair request expiry {expiry} exceeds maximum {max}")]
    ExpiryTooFar { expiry: u32, max: u32 },

    #[error("pair request {0} is already known")]
    DuplicateRequest(PairRequestId),

    #[error("identity {0} already has a pending request in this denomination")]
    DuplicateIdentity(PeerId),

    #[error("pair request {0} was excluded by a blame verdict")]
    Excluded(PairRequestId),

    #[error("unknown pair request {0}")]
    UnknownRequest(PairRequestId),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("invalid pair request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T, E = MixError> = std::result::Result<T, E>;
