//! Protocol phases and the deadline budget attached to each of them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Ordered steps of one run. Derived ordering follows declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    PairRequest,
    KeyExchange,
    Ciphertext,
    SlotReservation,
    DcExchange,
    Confirmation,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::PairRequest,
        Phase::KeyExchange,
        Phase::Ciphertext,
        Phase::SlotReservation,
        Phase::DcExchange,
        Phase::Confirmation,
    ];

    pub fn first() -> Phase {
        Phase::PairRequest
    }

    /// The phase after this one, or `None` once confirmations are in.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::PairRequest => Some(Phase::KeyExchange),
            Phase::KeyExchange => Some(Phase::Ciphertext),
            Phase::Ciphertext => Some(Phase::SlotReservation),
            Phase::SlotReservation => Some(Phase::DcExchange),
            Phase::DcExchange => Some(Phase::Confirmation),
            Phase::Confirmation => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Phase::PairRequest => 0,
            Phase::KeyExchange => 1,
            Phase::Ciphertext => 2,
            Phase::SlotReservation => 3,
            Phase::DcExchange => 4,
            Phase::Confirmation => 5,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Phase::PairRequest => "PR",
            Phase::KeyExchange => "KE",
            Phase::Ciphertext => "CT",
            Phase::SlotReservation => "SR",
            Phase::DcExchange => "DC",
            Phase::Confirmation => "CM",
        }
    }

    /// Multi-round phases keep collecting after a fault so one verdict covers every
    /// failure found in the phase.
    pub fn is_multi_round(self) -> bool {
        matches!(
            self,
            Phase::KeyExchange | Phase::Ciphertext | Phase::SlotReservation | Phase::DcExchange
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Where a run currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running(Phase),
    Done,
    /// Failed; the blame assigner decides who, if anyone, is responsible.
    Blamed,
    /// Stopped by the coordinator. Never produces a verdict.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running(_))
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            RunState::Running(phase) => Some(phase),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running(phase) => write!(f, "running {}", phase),
            RunState::Done => f.write_str("done"),
            RunState::Blamed => f.write_str("blamed"),
            RunState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Per-phase time budgets. Phase deadlines are cumulative from the run start, so an
/// overrun in one phase eats into later phases instead of extending the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBudgets {
    budgets: [Duration; 6],
}

impl PhaseBudgets {
    pub fn uniform(budget: Duration) -> Self {
        Self {
            budgets: [budget; 6],
        }
    }

    pub fn with(mut self, phase: Phase, budget: Duration) -> Self {
        self.budgets[phase.index()] = budget;
        self
    }

    pub fn get(&self, phase: Phase) -> Duration {
        self.budgets[phase.index()]
    }

    /// Sum of the budgets of every phase up to and including `phase`.
    pub fn cumulative(&self, phase: Phase) -> Duration {
        self.budgets[..=phase.index()].iter().sum()
    }

    pub fn total(&self) -> Duration {
        self.cumulative(Phase::Confirmation)
    }

    pub(crate) fn has_zero(&self) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| self.get(*p).is_zero())
    }
}
