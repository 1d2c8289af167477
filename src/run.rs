//! One attempt (epoch) at completing the protocol for a fixed participant set.
//!
//! [`SessionRun`] is a synchronous state machine: the caller feeds it messages, tells it
//! when time has passed, and asks it to advance. It never blocks and never performs I/O,
//! which keeps phase transitions strictly sequential and testable without a runtime.

use crate::crypto::{MixCrypto, PhaseOutput, RunContext, TxCandidate};
use crate::error::{MixError, PeerFault};
use crate::message::PhaseMessage;
use crate::peer::Peer;
use crate::phase::{Phase, PhaseBudgets, RunState};
use crate::types::{PeerId, SessionId};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a run ended up in [`RunState::Blamed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The phase deadline passed before every expected message arrived.
    Timeout { phase: Phase },
    /// At least one peer was flagged while collecting `phase`.
    Misbehavior { phase: Phase },
    /// The collaborator rejected the combined payloads of `phase`.
    Derivation { phase: Phase, reason: String },
    /// Something on this node went wrong; no remote peer is implicated by it.
    Local { phase: Phase, reason: String },
}

impl RunFailure {
    pub fn phase(&self) -> Phase {
        match self {
            RunFailure::Timeout { phase }
            | RunFailure::Misbehavior { phase }
            | RunFailure::Derivation { phase, .. }
            | RunFailure::Local { phase, .. } => *phase,
        }
    }
}

/// Result of offering a remote message to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Recorded against the sender.
    Faulted(PeerFault),
    /// Not for this run or not from a participant; nobody is blamed for it.
    Ignored(&'static str),
}

#[derive(Debug)]
pub struct SessionRun {
    ctx: RunContext,
    state: RunState,
    started_at: Instant,
    budgets: PhaseBudgets,
    peers: BTreeMap<PeerId, Peer>,
    outputs: BTreeMap<Phase, PhaseOutput>,
    history: Vec<Phase>,
    failure: Option<RunFailure>,
    transaction: Option<TxCandidate>,
}

impl SessionRun {
    pub fn new(ctx: RunContext, budgets: PhaseBudgets, started_at: Instant) -> Self {
        let peers = ctx
            .participants
            .iter()
            .map(|id| (*id, Peer::new(*id)))
            .collect();
        Self {
            ctx,
            state: RunState::Running(Phase::first()),
            started_at,
            budgets,
            peers,
            outputs: BTreeMap::new(),
            history: vec![Phase::first()],
            failure: None,
            transaction: None,
        }
    }

    /// Next epoch over the same participants with a fresh deadline.
    pub fn retry(&self, started_at: Instant) -> Self {
        let ctx = RunContext {
            epoch: self.ctx.epoch + 1,
            ..self.ctx.clone()
        };
        let peers = self
            .peers
            .values()
            .map(|peer| (*peer.id(), peer.fresh()))
            .collect();
        Self {
            peers,
            ..Self::new(ctx, self.budgets, started_at)
        }
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn session_id(&self) -> SessionId {
        self.ctx.session_id
    }

    pub fn epoch(&self) -> u32 {
        self.ctx.epoch
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn phase(&self) -> Option<Phase> {
        self.state.phase()
    }

    /// Phases entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn phase_deadline(&self, phase: Phase) -> Instant {
        self.started_at + self.budgets.cumulative(phase)
    }

    /// Deadline of the current phase, `None` once the run is terminal.
    pub fn deadline(&self) -> Option<Instant> {
        self.phase().map(|phase| self.phase_deadline(phase))
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn output(&self, phase: Phase) -> Option<&PhaseOutput> {
        self.outputs.get(&phase)
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn transaction(&self) -> Option<&TxCandidate> {
        self.transaction.as_ref()
    }

    /// Output of the phase before the current one.
    pub fn prior_output(&self) -> Option<&PhaseOutput> {
        let phase = self.phase()?;
        let index = phase.index().checked_sub(1)?;
        self.outputs.get(&Phase::ALL[index])
    }

    /// Records the local node's own payload for the current phase.
    pub fn submit_local(&mut self, payload: Vec<u8>) -> Result<(), MixError> {
        let Some(current) = self.phase() else {
            return Err(MixError::Cancelled);
        };
        let local = self.ctx.local;
        let peer = self
            .peers
            .get_mut(&local)
            .ok_or_else(|| MixError::Config("local identity is not a participant".into()))?;
        peer.record_message(current, payload, current)
            .map_err(|fault| MixError::Crypto(format!("local contribution rejected: {fault}")))
    }

    /// Offers a remote message to the run.
    pub fn submit(&mut self, message: &PhaseMessage, crypto: &dyn MixCrypto) -> Submission {
        let Some(current) = self.phase() else {
            return Submission::Ignored("run is finished");
        };
        if message.session_id != self.ctx.session_id || message.epoch != self.ctx.epoch {
            return Submission::Ignored("message bound to another run");
        }
        if message.sender == self.ctx.local {
            return Submission::Ignored("message claims the local identity");
        }
        let Some(peer) = self.peers.get_mut(&message.sender) else {
            return Submission::Ignored("sender is not a participant");
        };

        let recorded = peer.record_message(message.phase, message.payload.clone(), current);
        let fault = match recorded {
            Err(fault) => Some(fault),
            Ok(()) => crypto
                .validate(&self.ctx, message.phase, &message.sender, &message.payload)
                .err()
                .map(|reason| PeerFault::Malformed {
                    phase: message.phase,
                    reason,
                }),
        };

        match fault {
            None => Submission::Accepted,
            Some(fault) => {
                warn!(
                    "Peer {:?} misbehaved in session {:?} epoch {}: {}",
                    message.sender, self.ctx.session_id, self.ctx.epoch, fault
                );
                peer.mark_misbehaving(fault.clone());
                if !current.is_multi_round() {
                    self.blame(RunFailure::Misbehavior { phase: current });
                }
                Submission::Faulted(fault)
            }
        }
    }

    /// Remote participants that are neither flagged nor have submitted for `phase`.
    pub fn missing(&self, phase: Phase) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| *peer.id() != self.ctx.local)
            .filter(|peer| !peer.is_misbehaving() && !peer.has_submitted(phase))
            .map(|peer| *peer.id())
            .collect()
    }

    /// Every unflagged participant, the local node included, has supplied the current phase.
    pub fn is_phase_complete(&self) -> bool {
        match self.phase() {
            Some(phase) => self
                .peers
                .values()
                .all(|peer| peer.is_misbehaving() || peer.has_submitted(phase)),
            None => false,
        }
    }

    /// Moves past the current phase once it is complete. Returns the resulting state;
    /// an incomplete phase leaves the run untouched.
    pub fn advance(&mut self, crypto: &dyn MixCrypto) -> RunState {
        let Some(phase) = self.phase() else {
            return self.state;
        };
        if !self.is_phase_complete() {
            return self.state;
        }
        if self.peers.values().any(Peer::is_misbehaving) {
            self.blame(RunFailure::Misbehavior { phase });
            return self.state;
        }

        let payloads: BTreeMap<PeerId, Vec<u8>> = self
            .peers
            .values()
            .filter_map(|peer| peer.message(phase).map(|m| (*peer.id(), m.to_vec())))
            .collect();

        let output = match crypto.derive(&self.ctx, phase, &payloads) {
            Ok(output) => output,
            Err(fault) => {
                let mut implicated = 0;
                for id in &fault.implicated {
                    if *id == self.ctx.local {
                        continue;
                    }
                    if let Some(peer) = self.peers.get_mut(id) {
                        peer.mark_misbehaving(PeerFault::Implicated {
                            phase,
                            reason: fault.reason.clone(),
                        });
                        implicated += 1;
                    }
                }
                let failure = if implicated == 0 {
                    RunFailure::Local {
                        phase,
                        reason: fault.reason,
                    }
                } else {
                    RunFailure::Derivation {
                        phase,
                        reason: fault.reason,
                    }
                };
                self.blame(failure);
                return self.state;
            }
        };
        self.outputs.insert(phase, output);

        match phase.next() {
            Some(next) => {
                debug!(
                    "Session {:?} epoch {} advanced {} -> {}",
                    self.ctx.session_id, self.ctx.epoch, phase, next
                );
                self.state = RunState::Running(next);
                self.history.push(next);
            }
            None => match crypto.assemble_transaction(&self.ctx, &payloads) {
                Ok(tx) => {
                    info!(
                        "Session {:?} epoch {} confirmed by all {} participants",
                        self.ctx.session_id,
                        self.ctx.epoch,
                        self.peers.len()
                    );
                    self.transaction = Some(tx);
                    self.state = RunState::Done;
                }
                Err(e) => self.fail_local(e.to_string()),
            },
        }
        self.state
    }

    /// Blames the run if the current phase is past its deadline and still incomplete.
    pub fn expire(&mut self, now: Instant) -> bool {
        let (Some(phase), Some(deadline)) = (self.phase(), self.deadline()) else {
            return false;
        };
        if now < deadline || self.is_phase_complete() {
            return false;
        }
        warn!(
            "Session {:?} epoch {} timed out in {} waiting for {} peer(s)",
            self.ctx.session_id,
            self.ctx.epoch,
            phase,
            self.missing(phase).len()
        );
        self.blame(RunFailure::Timeout { phase });
        true
    }

    /// The local node could not take part in the current phase.
    pub fn fail_local(&mut self, reason: String) {
        if let Some(phase) = self.phase() {
            warn!(
                "Session {:?} epoch {} failed locally in {}: {}",
                self.ctx.session_id, self.ctx.epoch, phase, reason
            );
            self.blame(RunFailure::Local { phase, reason });
        }
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            info!(
                "Session {:?} epoch {} cancelled",
                self.ctx.session_id, self.ctx.epoch
            );
            self.state = RunState::Cancelled;
        }
    }

    fn blame(&mut self, failure: RunFailure) {
        if self.state.is_terminal() {
            return;
        }
        self.failure = Some(failure);
        self.state = RunState::Blamed;
    }
}
