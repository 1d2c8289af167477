//! Injection points around a run, used to force faults deterministically in tests and
//! simulations.

use crate::crypto::RunContext;
use crate::message::PhaseMessage;
use crate::phase::Phase;
use std::fmt;

/// Which outbound payload an observer is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeCtPublish,
    BeforeSrPublish,
    BeforeDcPublish,
}

impl HookPoint {
    /// Hook consulted before the local payload for `phase` is published, if any.
    pub fn before_publish(phase: Phase) -> Option<HookPoint> {
        match phase {
            Phase::Ciphertext => Some(HookPoint::BeforeCtPublish),
            Phase::SlotReservation => Some(HookPoint::BeforeSrPublish),
            Phase::DcExchange => Some(HookPoint::BeforeDcPublish),
            _ => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookPoint::BeforeCtPublish => "before-ct-publish",
            HookPoint::BeforeSrPublish => "before-sr-publish",
            HookPoint::BeforeDcPublish => "before-dc-publish",
        })
    }
}

/// What to do with an outbound message after the observer saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Continue,
    /// Record the payload locally but do not send it.
    Withhold,
}

/// Observer consulted when each epoch starts and at each [`HookPoint`] of every run the
/// client drives.
///
/// Each client owns its observer, so faults can be injected on a single node without
/// any process-wide state.
pub trait RunObserver: Send + Sync {
    /// Called once per epoch, before the local pair-request payload goes out.
    fn before_run(&self, _ctx: &RunContext) {}

    /// May rewrite `message` in place before it is recorded and published.
    fn before_publish(
        &self,
        _point: HookPoint,
        _ctx: &RunContext,
        _message: &mut PhaseMessage,
    ) -> HookAction {
        HookAction::Continue
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
