//! Pair request lifetime bounds derived from the chain tip.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall-clock window a freshly created pair request stays eligible for pairing.
pub const PAIR_REQUEST_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Network parameters consumed by the expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub target_block_interval: Duration,
}

impl ChainParams {
    pub fn new(target_block_interval: Duration) -> Self {
        Self {
            target_block_interval,
        }
    }
}

/// Returns the height after which a pair request created at `tip_height` is stale.
///
/// The window is rounded up to whole blocks and padded by one block, so a window
/// that divides evenly still covers its full duration.
pub fn max_expiry(tip_height: u32, params: &ChainParams) -> u32 {
    let window = PAIR_REQUEST_WINDOW.as_millis();
    let target = params.target_block_interval.as_millis().max(1);
    let blocks = u32::try_from(window.div_ceil(target)).unwrap_or(u32::MAX);
    tip_height.saturating_add(blocks).saturating_add(1)
}

/// A request with `expiry` may no longer join a run once the tip has moved past it.
pub fn is_expired(expiry: u32, tip_height: u32) -> bool {
    tip_height > expiry
}
