//! Outbound side of the peer network.
//!
//! The engine hands every message it wants relayed to a [`PeerNotifier`]. Inbound traffic
//! is pushed into [`Client::receive`](crate::client::Client::receive) by whoever owns the
//! transport.

use crate::error::MixError;
use crate::message::MixMessage;
use tokio::sync::mpsc;

/// Relays messages to the other mixing peers.
///
/// `publish` must not block; implementations queue the message and deliver it on their
/// own schedule.
pub trait PeerNotifier: Send + Sync {
    fn publish(&self, message: MixMessage) -> Result<(), MixError>;
}

/// Notifier that queues outbound messages on a channel for a transport task to drain.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    outgoing_tx: mpsc::UnboundedSender<MixMessage>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MixMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        (Self { outgoing_tx }, outgoing_rx)
    }
}

impl PeerNotifier for ChannelNotifier {
    fn publish(&self, message: MixMessage) -> Result<(), MixError> {
        self.outgoing_tx
            .send(message)
            .map_err(|_| MixError::Notifier("outbound queue closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PairRequest;
    use crate::types::{Denomination, OutputCommitment, PeerId};

    fn request() -> MixMessage {
        MixMessage::PairRequest(
            PairRequest::new(
                PeerId([1; 32]),
                vec![OutputCommitment([1; 32])],
                Denomination(10),
                100,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_publish_queues_message() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.publish(request()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), request());
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        assert!(matches!(
            notifier.publish(request()),
            Err(MixError::Notifier(_))
        ));
    }
}
