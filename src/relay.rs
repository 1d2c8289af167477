//! In-process message relay
//!
//! Fans every published message out to all connected peers except its sender, dropping
//! messages it has already relayed. Used by the simulation binary and the end-to-end tests
//! in place of a real network.

use crate::error::MixError;
use crate::message::{MessageId, MixMessage};
use crate::notifier::PeerNotifier;
use crate::types::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Seen-message cache timeout
const CACHE_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of relaying one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayResult {
    /// Message already relayed, ignored
    AlreadySeen,

    /// Message handed to this many peers
    Delivered(usize),
}

#[derive(Default)]
struct RelayState {
    subscribers: HashMap<PeerId, mpsc::UnboundedSender<MixMessage>>,
    seen_messages: HashMap<MessageId, Instant>,
}

/// Shared relay hub. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RwLock<RelayState>>,
    cache_timeout: Option<Duration>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a custom seen-message cache timeout
    pub fn with_cache_timeout(cache_timeout: Duration) -> Self {
        Self {
            state: Arc::default(),
            cache_timeout: Some(cache_timeout),
        }
    }

    /// Registers `peer` and returns its outbound handle and inbound queue. Connecting an
    /// already connected peer replaces its queue.
    pub fn connect(&self, peer: PeerId) -> (RelayHandle, mpsc::UnboundedReceiver<MixMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().subscribers.insert(peer, tx);
        debug!("Peer {:?} connected to relay", peer);
        (
            RelayHandle {
                peer,
                relay: self.clone(),
            },
            rx,
        )
    }

    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.write().subscribers.remove(peer).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.read().subscribers.len()
    }

    /// Delivers `message` to every connected peer other than `from`.
    pub fn broadcast(&self, from: &PeerId, message: MixMessage) -> RelayResult {
        let message_id = message.message_id();
        let mut state = self.write();
        if state.seen_messages.contains_key(&message_id) {
            trace!("Relay dropped duplicate message from {:?}", from);
            return RelayResult::AlreadySeen;
        }
        state.seen_messages.insert(message_id, Instant::now());

        let mut delivered = 0;
        // Queues whose receiver is gone are pruned on the way.
        state.subscribers.retain(|peer, tx| {
            if peer == from {
                return true;
            }
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        RelayResult::Delivered(delivered)
    }

    pub fn has_seen(&self, message_id: &MessageId) -> bool {
        self.read().seen_messages.contains_key(message_id)
    }

    /// Forget relayed messages older than the cache timeout
    pub fn cleanup_old_messages(&self) {
        let timeout = self.cache_timeout.unwrap_or(CACHE_TIMEOUT);
        self.write()
            .seen_messages
            .retain(|_, seen_at| seen_at.elapsed() < timeout);
    }

    pub fn seen_count(&self) -> usize {
        self.read().seen_messages.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RelayState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RelayState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One peer's connection to a [`MemoryRelay`].
#[derive(Clone)]
pub struct RelayHandle {
    peer: PeerId,
    relay: MemoryRelay,
}

impl RelayHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl PeerNotifier for RelayHandle {
    fn publish(&self, message: MixMessage) -> Result<(), MixError> {
        self.relay.broadcast(&self.peer, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PhaseMessage;
    use crate::phase::Phase;
    use crate::types::SessionId;

    fn message(sender: u8, payload: u8) -> MixMessage {
        MixMessage::Phase(PhaseMessage {
            session_id: SessionId([9; 32]),
            epoch: 0,
            phase: Phase::KeyExchange,
            sender: PeerId([sender; 32]),
            payload: vec![payload],
        })
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let relay = MemoryRelay::new();
        let (a, mut rx_a) = relay.connect(PeerId([1; 32]));
        let (_b, mut rx_b) = relay.connect(PeerId([2; 32]));
        let (_c, mut rx_c) = relay.connect(PeerId([3; 32]));

        a.publish(message(1, 0)).unwrap();
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), message(1, 0));
        assert_eq!(rx_c.try_recv().unwrap(), message(1, 0));
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let relay = MemoryRelay::new();
        let (_a, _rx_a) = relay.connect(PeerId([1; 32]));
        let (_b, mut rx_b) = relay.connect(PeerId([2; 32]));

        let msg = message(1, 5);
        assert_eq!(relay.broadcast(&PeerId([1; 32]), msg.clone()), RelayResult::Delivered(1));
        assert_eq!(relay.broadcast(&PeerId([1; 32]), msg.clone()), RelayResult::AlreadySeen);
        assert!(relay.has_seen(&msg.message_id()));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_is_pruned() {
        let relay = MemoryRelay::new();
        let (_a, _rx_a) = relay.connect(PeerId([1; 32]));
        let (_b, rx_b) = relay.connect(PeerId([2; 32]));
        drop(rx_b);
        assert_eq!(relay.broadcast(&PeerId([1; 32]), message(1, 1)), RelayResult::Delivered(0));
        assert_eq!(relay.peer_count(), 1);
    }

    #[test]
    fn test_cleanup_old_messages() {
        let relay = MemoryRelay::with_cache_timeout(Duration::ZERO);
        relay.broadcast(&PeerId([1; 32]), message(1, 1));
        assert_eq!(relay.seen_count(), 1);
        relay.cleanup_old_messages();
        assert_eq!(relay.seen_count(), 0);
    }
}
