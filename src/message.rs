//! Messages exchanged between mixing peers

use crate::error::MixError;
use crate::phase::Phase;
use crate::types::{tagged_hash, Denomination, OutputCommitment, PairRequestId, PeerId, SessionId};
use serde::{Deserialize, Serialize};

/// Unique message identifier
pub type MessageId = [u8; 32];

/// Advertisement of intent to mix a set of outputs until `expiry`.
///
/// Immutable once built. Outputs are kept sorted and unique so the request hash does not
/// depend on the order the wallet listed them in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PairRequest {
    identity: PeerId,
    outputs: Vec<OutputCommitment>,
    denomination: Denomination,
    expiry: u32,
}

impl PairRequest {
    pub fn new(
        identity: PeerId,
        outputs: Vec<OutputCommitment>,
        denomination: Denomination,
        expiry: u32,
    ) -> Result<Self, MixError> {
        let request = Self {
            identity,
            outputs: normalize(outputs),
            denomination,
            expiry,
        };
        request.check()?;
        Ok(request)
    }

    /// Structural checks for requests that arrive over the wire.
    pub fn check(&self) -> Result<(), MixError> {
        if self.outputs.is_empty() {
            return Err(MixError::InvalidRequest("no outputs offered".into()));
        }
        if self.denomination.0 == 0 {
            return Err(MixError::InvalidRequest("zero denomination".into()));
        }
        if self.outputs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MixError::InvalidRequest(
                "outputs are not sorted and unique".into(),
            ));
        }
        Ok(())
    }

    pub fn id(&self) -> PairRequestId {
        let encoded = bincode::serialize(self).unwrap_or_default();
        PairRequestId(tagged_hash(b"mixclient/pair-request/v1", &[encoded.as_slice()]))
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn outputs(&self) -> &[OutputCommitment] {
        &self.outputs
    }

    pub fn denomination(&self) -> Denomination {
        self.denomination
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }
}

fn normalize(mut outputs: Vec<OutputCommitment>) -> Vec<OutputCommitment> {
    outputs.sort_unstable();
    outputs.dedup();
    outputs
}

/// One peer's contribution to one phase of one run.
///
/// `session_id` and `epoch` bind the payload to a single run so it cannot be replayed
/// into another.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PhaseMessage {
    pub session_id: SessionId,
    pub epoch: u32,
    pub phase: Phase,
    pub sender: PeerId,
    pub payload: Vec<u8>,
}

/// Message type for P2P communication
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MixMessage {
    /// Pairing: advertise outputs for mixing
    PairRequest(PairRequest),

    /// Run: phase payload for a session epoch
    Phase(PhaseMessage),

    /// Inventory: a session completed and consumed these pair requests
    Announcement {
        session_id: SessionId,
        sender: PeerId,
        tx_hash: [u8; 32],
        consumed: Vec<PairRequestId>,
    },
}

impl MixMessage {
    /// Get the sender peer ID
    pub fn sender(&self) -> &PeerId {
        match self {
            MixMessage::PairRequest(request) => request.identity(),
            MixMessage::Phase(message) => &message.sender,
            MixMessage::Announcement { sender, .. } => sender,
        }
    }

    /// Content-addressed identifier used for relay deduplication.
    pub fn message_id(&self) -> MessageId {
        let encoded = bincode::serialize(self).unwrap_or_default();
        tagged_hash(b"mixclient/message/v1", &[encoded.as_slice()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(b: u8) -> OutputCommitment {
        OutputCommitment([b; 32])
    }

    #[test]
    fn test_pair_request_id_ignores_output_order() {
        let a = PairRequest::new(
            PeerId([1; 32]),
            vec![output(3), output(1), output(2)],
            Denomination(100),
            50,
        )
        .unwrap();
        let b = PairRequest::new(
            PeerId([1; 32]),
            vec![output(2), output(3), output(1), output(1)],
            Denomination(100),
            50,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.outputs().len(), 3);
    }

    #[test]
    fn test_pair_request_id_binds_expiry() {
        let a = PairRequest::new(PeerId([1; 32]), vec![output(1)], Denomination(100), 50).unwrap();
        let b = PairRequest::new(PeerId([1; 32]), vec![output(1)], Denomination(100), 51).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_pair_request_rejects_empty_outputs() {
        let err = PairRequest::new(PeerId([1; 32]), vec![], Denomination(100), 50).unwrap_err();
        assert!(matches!(err, MixError::InvalidRequest(_)));
    }

    #[test]
    fn test_wire_request_must_be_sorted() {
        let request =
            PairRequest::new(PeerId([1; 32]), vec![output(1), output(2)], Denomination(1), 9).unwrap();
        let mut bytes = bincode::serialize(&request).unwrap();
        // Swap the two 32-byte outputs in place; they follow the identity and the length prefix.
        let start = 32 + 8;
        let (first, second) = bytes[start..start + 64].split_at_mut(32);
        first.swap_with_slice(second);
        let tampered: PairRequest = bincode::deserialize(&bytes).unwrap();
        assert!(tampered.check().is_err());
    }

    #[test]
    fn test_sender() {
        let msg = MixMessage::Phase(PhaseMessage {
            session_id: SessionId([0; 32]),
            epoch: 0,
            phase: Phase::KeyExchange,
            sender: PeerId([7; 32]),
            payload: vec![1, 2, 3],
        });
        assert_eq!(msg.sender(), &PeerId([7; 32]));
    }
}
