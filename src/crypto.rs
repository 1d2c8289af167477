//! Boundary to the cryptographic collaborator.
//!
//! The engine never looks inside payloads. It asks the collaborator for the local
//! contribution to each phase, whether a peer's payload is acceptable, and what a complete
//! phase derives to. [`DigestCrypto`] is a deterministic stand-in that exercises the
//! engine without real key exchange or DC-net arithmetic.

use crate::error::MixError;
use crate::phase::Phase;
use crate::types::{tagged_hash, PeerId, SessionId};
use std::collections::BTreeMap;

/// The fixed facts of one run, shared with the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub session_id: SessionId,
    pub epoch: u32,
    pub local: PeerId,
    /// Sorted, includes `local`.
    pub participants: Vec<PeerId>,
}

/// Result of deriving a complete phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutput(pub Vec<u8>);

/// Derivation failed and the listed peers are responsible. More than one peer is listed
/// when the collaborator cannot tell which of them is at fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveFault {
    pub implicated: Vec<PeerId>,
    pub reason: String,
}

/// Unsigned transaction assembled from confirmed outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCandidate {
    pub bytes: Vec<u8>,
}

impl TxCandidate {
    pub fn hash(&self) -> [u8; 32] {
        tagged_hash(b"mixclient/tx/v1", &[self.bytes.as_slice()])
    }
}

pub trait MixCrypto: Send + Sync {
    /// Payload the local node publishes for `phase`. `prior` is the previous phase's output.
    fn contribute(
        &self,
        ctx: &RunContext,
        phase: Phase,
        prior: Option<&PhaseOutput>,
    ) -> Result<Vec<u8>, MixError>;

    /// Checks signer binding and structure of a single payload.
    fn validate(
        &self,
        ctx: &RunContext,
        phase: Phase,
        sender: &PeerId,
        payload: &[u8],
    ) -> Result<(), String>;

    /// Combines the full set of payloads for `phase`. For the confirmation phase this is
    /// the cross-check of every peer's confirmation against the others.
    fn derive(
        &self,
        ctx: &RunContext,
        phase: Phase,
        payloads: &BTreeMap<PeerId, Vec<u8>>,
    ) -> Result<PhaseOutput, DeriveFault>;

    fn assemble_transaction(
        &self,
        ctx: &RunContext,
        confirmed: &BTreeMap<PeerId, Vec<u8>>,
    ) -> Result<TxCandidate, MixError>;
}

const DIGEST_LEN: usize = 32;

/// Hash-based collaborator. Each payload is a phase tag byte followed by a 32-byte digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestCrypto;

impl DigestCrypto {
    fn tag(phase: Phase) -> u8 {
        0xa0 + phase.index() as u8
    }
}

impl MixCrypto for DigestCrypto {
    fn contribute(
        &self,
        ctx: &RunContext,
        phase: Phase,
        prior: Option<&PhaseOutput>,
    ) -> Result<Vec<u8>, MixError> {
        let prior = prior.map(|p| p.0.as_slice()).unwrap_or_default();
        let body = if phase == Phase::Confirmation {
            // Every honest peer confirms the same DC output.
            if prior.len() != DIGEST_LEN {
                return Err(MixError::Crypto("missing DC output to confirm".into()));
            }
            prior.to_vec()
        } else {
            tagged_hash(
                b"mixclient/digest/contribution",
                &[
                    &ctx.session_id.as_bytes()[..],
                    &ctx.epoch.to_le_bytes()[..],
                    &[phase.index() as u8][..],
                    &ctx.local.as_bytes()[..],
                    prior,
                ],
            )
            .to_vec()
        };
        let mut payload = Vec::with_capacity(1 + DIGEST_LEN);
        payload.push(Self::tag(phase));
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    fn validate(
        &self,
        _ctx: &RunContext,
        phase: Phase,
        _sender: &PeerId,
        payload: &[u8],
    ) -> Result<(), String> {
        if payload.len() != 1 + DIGEST_LEN {
            return Err(format!(
                "expected {} bytes, got {}",
                1 + DIGEST_LEN,
                payload.len()
            ));
        }
        if payload[0] != Self::tag(phase) {
            return Err(format!("wrong phase tag {:#04x}", payload[0]));
        }
        Ok(())
    }

    fn derive(
        &self,
        ctx: &RunContext,
        phase: Phase,
        payloads: &BTreeMap<PeerId, Vec<u8>>,
    ) -> Result<PhaseOutput, DeriveFault> {
        if phase == Phase::Confirmation {
            let expected = payloads.get(&ctx.local).ok_or_else(|| DeriveFault {
                implicated: Vec::new(),
                reason: "local confirmation missing".into(),
            })?;
            let implicated: Vec<PeerId> = payloads
                .iter()
                .filter(|(_, payload)| *payload != expected)
                .map(|(peer, _)| *peer)
                .collect();
            if !implicated.is_empty() {
                return Err(DeriveFault {
                    implicated,
                    reason: "confirmation does not match the derived DC output".into(),
                });
            }
            return Ok(PhaseOutput(expected[1..].to_vec()));
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(payloads.len() * 2 + 1);
        let index = [phase.index() as u8];
        parts.push(&index);
        for (peer, payload) in payloads {
            parts.push(peer.as_bytes());
            parts.push(payload);
        }
        Ok(PhaseOutput(
            tagged_hash(b"mixclient/digest/derive", &parts).to_vec(),
        ))
    }

    fn assemble_transaction(
        &self,
        ctx: &RunContext,
        confirmed: &BTreeMap<PeerId, Vec<u8>>,
    ) -> Result<TxCandidate, MixError> {
        let mut bytes = Vec::with_capacity(32 + confirmed.len() * (32 + 1 + DIGEST_LEN));
        bytes.extend_from_slice(ctx.session_id.as_bytes());
        for (peer, confirmation) in confirmed {
            bytes.extend_from_slice(peer.as_bytes());
            bytes.extend_from_slice(confirmation);
        }
        Ok(TxCandidate { bytes })
    }
}
