//! Coordinator configuration

use crate::error::MixError;
use crate::expiry::ChainParams;
use crate::phase::PhaseBudgets;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a mixing [`Client`](crate::client::Client).
///
/// The participant minimum and phase budgets have no defaults; the embedder picks them
/// for its network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixConfig {
    /// Sessions with fewer participants than this do not form
    pub min_participants: usize,

    /// Per-phase time budgets
    pub phase_budgets: PhaseBudgets,

    /// Empty verdicts retried before the session is given up
    pub max_no_fault_retries: u32,

    /// Interval of the background pairing loop
    pub pairing_interval: Duration,

    /// Chain parameters for expiry bounds
    pub chain: ChainParams,

    /// Buffered phase messages per not-yet-formed session
    pub pending_message_limit: usize,

    /// Not-yet-formed sessions with buffered phase messages
    pub pending_session_limit: usize,
}

impl MixConfig {
    pub fn new(min_participants: usize, phase_budgets: PhaseBudgets, chain: ChainParams) -> Self {
        Self {
            min_participants,
            phase_budgets,
            max_no_fault_retries: 3,
            pairing_interval: Duration::from_secs(30),
            chain,
            pending_message_limit: 64,
            pending_session_limit: 128,
        }
    }

    pub fn with_max_no_fault_retries(mut self, retries: u32) -> Self {
        self.max_no_fault_retries = retries;
        self
    }

    pub fn with_pairing_interval(mut self, interval: Duration) -> Self {
        self.pairing_interval = interval;
        self
    }

    pub fn with_pending_message_limit(mut self, limit: usize) -> Self {
        self.pending_message_limit = limit;
        self
    }

    pub fn with_pending_session_limit(mut self, limit: usize) -> Self {
        self.pending_session_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), MixError> {
        // A mix needs at least two parties to hide anything.
        if self.min_participants < 2 {
            return Err(MixError::Config(
                "min_participants must be at least 2".to_string(),
            ));
        }
        if let Some(phase) = self.phase_budgets.has_zero() {
            return Err(MixError::Config(format!(
                "budget for phase {} must be non-zero",
                phase
            )));
        }
        if self.chain.target_block_interval.is_zero() {
            return Err(MixError::Config(
                "target block interval must be non-zero".to_string(),
            ));
        }
        if self.pairing_interval.is_zero() {
            return Err(MixError::Config(
                "pairing interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    fn config() -> MixConfig {
        MixConfig::new(
            3,
            PhaseBudgets::uniform(Duration::from_secs(10)),
            ChainParams::new(Duration::from_secs(150)),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_single_participant() {
        let mut c = config();
        c.min_participants = 1;
        assert!(matches!(c.validate(), Err(MixError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_budget() {
        let mut c = config();
        c.phase_budgets = c.phase_budgets.with(Phase::DcExchange, Duration::ZERO);
        let err = c.validate().unwrap_err();
        assert_eq!(
            err,
            MixError::Config(format!("budget for phase {} must be non-zero", Phase::DcExchange))
        );
    }

    #[test]
    fn test_rejects_zero_block_interval() {
        let mut c = config();
        c.chain = ChainParams::new(Duration::ZERO);
        assert!(c.validate().is_err());
    }
}
