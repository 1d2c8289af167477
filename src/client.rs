//! Session coordinator.
//!
//! A [`Client`] owns the local pair requests of one identity. It pairs them with the
//! requests it hears about, drives one task per formed session through every run epoch
//! until the mix completes or the session falls apart, and reports the result of each
//! local request on the outcome channel returned by [`Client::new`].
//!
//! The request pool and the output lock set live behind one mutex shared by every run
//! task. Run tasks only take it between epochs; message collection inside an epoch works
//! on task-local state.

use crate::blame::{BlameAssigner, BlameVerdict};
use crate::config::MixConfig;
use crate::crypto::{MixCrypto, TxCandidate};
use crate::error::MixError;
use crate::hooks::{HookAction, HookPoint, RunObserver};
use crate::message::{MixMessage, PairRequest, PhaseMessage};
use crate::notifier::PeerNotifier;
use crate::paired::{FormedSession, NextRun, PairedSessions};
use crate::phase::{Phase, RunState};
use crate::run::{SessionRun, Submission};
use crate::types::{OutputCommitment, PairRequestId, PeerId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Why a local request left its session without a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    InsufficientPeers { have: usize, need: usize },
    Cancelled,
    Expired,
    RetriesExhausted { retries: u32 },
    OutputsSpent,
    Local(MixError),
}

impl From<MixError> for FailureReason {
    fn from(error: MixError) -> Self {
        match error {
            MixError::InsufficientPeers { have, need } => {
                FailureReason::InsufficientPeers { have, need }
            }
            MixError::Expired { .. } => FailureReason::Expired,
            MixError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Local(other),
        }
    }
}

/// Terminal result for one local pair request.
#[derive(Debug, Clone)]
pub enum MixOutcome {
    /// Every participant confirmed; the transaction is ready for signing.
    Completed {
        request: PairRequest,
        session_id: SessionId,
        epoch: u32,
        transaction: TxCandidate,
        /// Verdicts of the failed epochs before this one.
        verdicts: Vec<BlameVerdict>,
    },
    /// The request is idle again, or gone if it expired or its outputs were spent.
    Failed {
        request: PairRequest,
        reason: FailureReason,
        verdicts: Vec<BlameVerdict>,
    },
}

impl MixOutcome {
    pub fn request(&self) -> &PairRequest {
        match self {
            MixOutcome::Completed { request, .. } | MixOutcome::Failed { request, .. } => request,
        }
    }

    pub fn verdicts(&self) -> &[BlameVerdict] {
        match self {
            MixOutcome::Completed { verdicts, .. } | MixOutcome::Failed { verdicts, .. } => {
                verdicts
            }
        }
    }
}

struct RunHandle {
    generation: u64,
    local: PairRequestId,
    inbox: mpsc::UnboundedSender<PhaseMessage>,
    cancel: watch::Sender<Option<FailureReason>>,
}

/// Phase messages for a session this node has not formed (yet).
struct Pending {
    first_seen: Instant,
    messages: Vec<PhaseMessage>,
}

struct State {
    pool: PairedSessions,
    runs: HashMap<SessionId, RunHandle>,
    pending: HashMap<SessionId, Pending>,
    /// Tag of the most recently started run.
    generation: u64,
    shut_down: bool,
}

impl State {
    /// The handle under `session_id` still belongs to the run tagged `generation`. A run
    /// cancelled and re-formed under the same id gets a new tag.
    fn owns(&self, session_id: &SessionId, generation: u64) -> bool {
        self.runs
            .get(session_id)
            .is_some_and(|handle| handle.generation == generation)
    }

    fn detach(&mut self, session_id: &SessionId, generation: u64) -> bool {
        if !self.owns(session_id, generation) {
            return false;
        }
        self.runs.remove(session_id);
        true
    }

    /// Detaches the run and unlocks its outputs, unless a newer run holds the id.
    fn retire(&mut self, session_id: &SessionId, generation: u64) {
        if self.detach(session_id, generation) {
            self.pool.release(session_id);
        }
    }
}

struct Inner {
    local: PeerId,
    config: MixConfig,
    crypto: Arc<dyn MixCrypto>,
    notifier: Arc<dyn PeerNotifier>,
    observer: Arc<dyn RunObserver>,
    blame: BlameAssigner,
    state: Mutex<State>,
    outcomes: mpsc::UnboundedSender<MixOutcome>,
}

/// Handle to a mixing coordinator. Clones share the same coordinator.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(
        local: PeerId,
        config: MixConfig,
        crypto: Arc<dyn MixCrypto>,
        notifier: Arc<dyn PeerNotifier>,
        observer: Arc<dyn RunObserver>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MixOutcome>), MixError> {
        config.validate()?;
        let (outcomes, outcomes_rx) = mpsc::unbounded_channel();
        let pool = PairedSessions::new(config.min_participants, config.chain, 0);
        let inner = Inner {
            local,
            config,
            crypto,
            notifier,
            observer,
            blame: BlameAssigner,
            state: Mutex::new(State {
                pool,
                runs: HashMap::new(),
                pending: HashMap::new(),
                generation: 0,
                shut_down: false,
            }),
            outcomes,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            outcomes_rx,
        ))
    }

    pub fn local(&self) -> &PeerId {
        &self.inner.local
    }

    /// Adds a local pair request to the pool and advertises it.
    pub async fn submit(&self, request: PairRequest) -> Result<PairRequestId, MixError> {
        if request.identity() != &self.inner.local {
            return Err(MixError::InvalidRequest(format!(
                "request identity {} is not the local identity {}",
                request.identity(),
                self.inner.local
            )));
        }
        let id = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(MixError::Cancelled);
            }
            state.pool.accept(request.clone(), true)?
        };
        info!(
            "Submitted pair request {:?} for {} output(s)",
            id,
            request.outputs().len()
        );
        self.inner.notifier.publish(MixMessage::PairRequest(request))?;
        Ok(id)
    }

    /// Handles one inbound message.
    pub async fn receive(&self, message: MixMessage) -> Result<(), MixError> {
        if message.sender() == &self.inner.local {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        match message {
            MixMessage::PairRequest(request) => {
                state.pool.accept(request, false)?;
            }
            MixMessage::Phase(message) => {
                if let Some(handle) = state.runs.get(&message.session_id) {
                    // A closed inbox means the task is wrapping up the session.
                    let _ = handle.inbox.send(message);
                    return Ok(());
                }
                self.inner.buffer(&mut state, message);
            }
            MixMessage::Announcement {
                session_id,
                sender,
                consumed,
                ..
            } => {
                let removed = state.pool.consume(&session_id, &consumed)?;
                debug!(
                    "Peer {:?} completed session {:?}; dropped {} consumed request(s)",
                    sender, session_id, removed
                );
            }
        }
        Ok(())
    }

    /// Spawns a task feeding `inbound` into [`Client::receive`] until the queue closes.
    pub fn attach(&self, mut inbound: mpsc::UnboundedReceiver<MixMessage>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = client.receive(message).await {
                    debug!("Rejected inbound message: {}", e);
                }
            }
        })
    }

    /// Tries to form a session for every idle local request. After [`Client::shutdown`]
    /// every idle request reports [`MixError::Cancelled`] instead.
    pub async fn pair(&self) -> Vec<(PairRequestId, Result<SessionId, MixError>)> {
        let mut state = self.inner.state.lock().await;
        let idle = state.pool.idle_local();
        if state.shut_down {
            return idle
                .into_iter()
                .map(|id| (id, Err(MixError::Cancelled)))
                .collect();
        }
        let mut results = Vec::with_capacity(idle.len());
        for id in idle {
            let result = match state.pool.form_session(&id) {
                Ok(formed) => Ok(self.inner.start_run(&mut state, formed)),
                Err(e) => {
                    debug!("Pair request {:?} not paired: {}", id, e);
                    Err(e)
                }
            };
            results.push((id, result));
        }
        results
    }

    /// Calls [`Client::pair`] every `pairing_interval` until the client is dropped or
    /// shut down.
    pub fn spawn_pairing_loop(&self) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.pairing_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if inner.state.lock().await.shut_down {
                    debug!("Pairing loop of {:?} stopped", inner.local);
                    return;
                }
                Client { inner }.pair().await;
            }
        })
    }

    /// Cancels the run holding `request`, if any. Its outputs are unlocked before this
    /// returns and the request stays in the pool.
    pub async fn cancel(&self, request: &PairRequestId) -> Result<(), MixError> {
        let mut state = self.inner.state.lock().await;
        if !state.pool.is_local(request) {
            return Err(MixError::UnknownRequest(*request));
        }
        let running = state
            .runs
            .iter()
            .find(|(_, handle)| handle.local == *request)
            .map(|(id, _)| *id);
        if let Some(session_id) = running {
            self.inner
                .cancel_run(&mut state, &session_id, FailureReason::Cancelled);
        }
        Ok(())
    }

    /// Cancels every running session and stops pairing. Requests stay in the pool but no
    /// new session forms for them.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.shut_down = true;
        let sessions: Vec<SessionId> = state.runs.keys().copied().collect();
        for session_id in sessions {
            self.inner
                .cancel_run(&mut state, &session_id, FailureReason::Cancelled);
        }
    }

    /// The outputs can no longer be mixed. Drops every request offering one of them and
    /// cancels the sessions that hold them. Returns the number of cancelled sessions.
    pub async fn outputs_spent(&self, outputs: &[OutputCommitment]) -> usize {
        let mut state = self.inner.state.lock().await;
        let (sessions, dropped) = state.pool.remove_spent(outputs);
        let mut running = HashSet::new();
        for session_id in &sessions {
            if let Some(handle) = state.runs.get(session_id) {
                running.insert(handle.local);
            }
            self.inner
                .cancel_run(&mut state, session_id, FailureReason::OutputsSpent);
        }
        for request in dropped {
            if !running.contains(&request.id()) {
                self.inner.emit(MixOutcome::Failed {
                    request,
                    reason: FailureReason::OutputsSpent,
                    verdicts: Vec::new(),
                });
            }
        }
        sessions.len()
    }

    /// Moves the chain tip. Idle local requests that expired are reported and dropped.
    pub async fn set_tip(&self, height: u32) {
        let mut state = self.inner.state.lock().await;
        for request in state.pool.set_tip(height) {
            info!(
                "Pair request {:?} expired at height {} (tip {})",
                request.id(),
                request.expiry(),
                height
            );
            self.inner.emit(MixOutcome::Failed {
                request,
                reason: FailureReason::Expired,
                verdicts: Vec::new(),
            });
        }
    }

    /// Latest expiry a request created now may carry.
    pub async fn max_expiry(&self) -> u32 {
        self.inner.state.lock().await.pool.max_expiry()
    }

    pub async fn is_locked(&self, output: &OutputCommitment) -> bool {
        self.inner.state.lock().await.pool.is_locked(output)
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.state.lock().await.runs.len()
    }

    pub async fn knows_request(&self, id: &PairRequestId) -> bool {
        self.inner.state.lock().await.pool.request(id).is_some()
    }
}

impl Inner {
    fn emit(&self, outcome: MixOutcome) {
        if self.outcomes.send(outcome).is_err() {
            debug!("Outcome receiver dropped");
        }
    }

    fn buffer(&self, state: &mut State, message: PhaseMessage) {
        let now = Instant::now();
        let horizon = self.config.phase_budgets.total() + self.config.pairing_interval;
        state
            .pending
            .retain(|_, pending| now.duration_since(pending.first_seen) < horizon);
        if !state.pending.contains_key(&message.session_id)
            && state.pending.len() >= self.config.pending_session_limit
        {
            trace!(
                "Dropping early message for session {:?}: too many pending sessions",
                message.session_id
            );
            return;
        }

        let pending = state
            .pending
            .entry(message.session_id)
            .or_insert_with(|| Pending {
                first_seen: now,
                messages: Vec::new(),
            });
        if pending.messages.len() >= self.config.pending_message_limit {
            trace!(
                "Dropping early message for session {:?}: buffer full",
                message.session_id
            );
            return;
        }
        pending.messages.push(message);
    }

    /// Unlocks the session's outputs, detaches its task and tells it to stop.
    fn cancel_run(&self, state: &mut State, session_id: &SessionId, reason: FailureReason) {
        state.pool.release(session_id);
        if let Some(handle) = state.runs.remove(session_id) {
            info!("Cancelling session {:?}: {:?}", session_id, reason);
            handle.cancel.send_replace(Some(reason));
        }
    }

    fn start_run(self: &Arc<Self>, state: &mut State, formed: FormedSession) -> SessionId {
        let session_id = formed.session.id();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(None);
        state.generation += 1;
        let generation = state.generation;
        if let Some(pending) = state.pending.remove(&session_id) {
            for message in pending.messages {
                let _ = inbox.send(message);
            }
        }
        state.runs.insert(
            session_id,
            RunHandle {
                generation,
                local: formed.local,
                inbox,
                cancel,
            },
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .drive(formed, generation, inbox_rx, cancel_rx)
                .await
        });
        session_id
    }

    /// Runs epochs of one session until it completes, is cancelled or dissolves.
    async fn drive(
        self: Arc<Self>,
        mut formed: FormedSession,
        generation: u64,
        mut inbox: mpsc::UnboundedReceiver<PhaseMessage>,
        mut cancel: watch::Receiver<Option<FailureReason>>,
    ) {
        let Some(request) = formed.local_request().cloned() else {
            error!("Session {:?} formed without the local request", formed.session.id());
            return;
        };
        let mut verdicts: Vec<BlameVerdict> = Vec::new();
        let mut deferred: Vec<PhaseMessage> = Vec::new();
        let mut no_fault_retries = 0;

        loop {
            let Some(ctx) = formed.context() else {
                error!("Session {:?} lost its local participant", formed.session.id());
                return;
            };
            let mut run = SessionRun::new(ctx, self.config.phase_budgets, Instant::now());
            info!(
                "Starting session {:?} epoch {} with {} participants",
                run.session_id(),
                run.epoch(),
                run.ctx().participants.len()
            );
            self.observer.before_run(run.ctx());

            deferred.retain(|m| m.epoch >= run.epoch());
            let (ready, later): (Vec<_>, Vec<_>) = deferred
                .drain(..)
                .partition(|m| m.session_id == run.session_id() && m.epoch == run.epoch());
            deferred = later;
            for message in ready {
                self.offer(&mut run, message, &mut deferred);
            }

            self.drive_epoch(&mut run, &mut inbox, &mut cancel, &mut deferred)
                .await;

            let session_id = run.session_id();
            let mut state = self.state.lock().await;

            let cancelled = cancel.borrow().clone().or_else(|| {
                (run.state() == RunState::Cancelled).then_some(FailureReason::Cancelled)
            });
            if let Some(reason) = cancelled {
                state.retire(&session_id, generation);
                drop(state);
                self.emit(MixOutcome::Failed {
                    request,
                    reason,
                    verdicts,
                });
                return;
            }

            if run.state() == RunState::Done {
                state.detach(&session_id, generation);
                let consumed = state.pool.complete(&session_id);
                drop(state);
                self.finish(run, request, consumed, verdicts);
                return;
            }

            let Some(verdict) = self.blame.assign(&run) else {
                // Only a blamed run is left at this point.
                state.retire(&session_id, generation);
                drop(state);
                self.emit(MixOutcome::Failed {
                    request,
                    reason: FailureReason::Local(MixError::Cancelled),
                    verdicts,
                });
                return;
            };
            info!(
                "Session {:?} epoch {} blamed at {}: {} ({} peer(s))",
                verdict.session_id,
                verdict.epoch,
                verdict.phase,
                verdict.reason,
                verdict.blamed.len()
            );
            for peer in &verdict.blamed {
                debug!("  blamed {:?}", peer);
            }

            let next = if verdict.is_empty() {
                if no_fault_retries >= self.config.max_no_fault_retries {
                    state.retire(&session_id, generation);
                    drop(state);
                    warn!(
                        "Session {:?} gave up after {} no-fault retries",
                        session_id, no_fault_retries
                    );
                    verdicts.push(verdict);
                    self.emit(MixOutcome::Failed {
                        request,
                        reason: FailureReason::RetriesExhausted {
                            retries: no_fault_retries,
                        },
                        verdicts,
                    });
                    return;
                }
                no_fault_retries += 1;
                state.pool.retry(&session_id)
            } else {
                state.pool.apply_verdict(&verdict)
            };
            verdicts.push(verdict);

            match next {
                Ok(NextRun::Retry(next)) | Ok(NextRun::Reformed(next)) => {
                    let next_id = next.session.id();
                    if next_id != session_id && state.owns(&session_id, generation) {
                        if let Some(handle) = state.runs.remove(&session_id) {
                            state.runs.insert(next_id, handle);
                        }
                        if let Some(pending) = state.pending.remove(&next_id) {
                            deferred.extend(pending.messages);
                        }
                    }
                    formed = next;
                }
                Ok(NextRun::Dissolved(e)) => {
                    state.detach(&session_id, generation);
                    drop(state);
                    self.emit(MixOutcome::Failed {
                        request,
                        reason: e.into(),
                        verdicts,
                    });
                    return;
                }
                Err(e) => {
                    state.retire(&session_id, generation);
                    drop(state);
                    self.emit(MixOutcome::Failed {
                        request,
                        reason: FailureReason::Local(e),
                        verdicts,
                    });
                    return;
                }
            }
        }
    }

    /// Drives a single epoch until it leaves the running state.
    async fn drive_epoch(
        &self,
        run: &mut SessionRun,
        inbox: &mut mpsc::UnboundedReceiver<PhaseMessage>,
        cancel: &mut watch::Receiver<Option<FailureReason>>,
        deferred: &mut Vec<PhaseMessage>,
    ) {
        while let Some(phase) = run.phase() {
            let local = run.ctx().local;
            let submitted = run.peer(&local).is_some_and(|p| p.has_submitted(phase));
            if !submitted {
                if let Err(e) = self.publish_local(run, phase) {
                    run.fail_local(e.to_string());
                    continue;
                }
            }
            if run.is_phase_complete() {
                run.advance(self.crypto.as_ref());
                continue;
            }
            let Some(deadline) = run.deadline() else {
                return;
            };

            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || cancel.borrow().is_some() {
                        run.cancel();
                    }
                }
                message = inbox.recv() => match message {
                    Some(message) => self.offer(run, message, deferred),
                    None => run.fail_local("inbound queue closed".to_string()),
                },
                _ = sleep_until(deadline) => {
                    run.expire(Instant::now());
                }
            }
        }
    }

    fn publish_local(&self, run: &mut SessionRun, phase: Phase) -> Result<(), MixError> {
        let payload = self
            .crypto
            .contribute(run.ctx(), phase, run.prior_output())?;
        let mut message = PhaseMessage {
            session_id: run.session_id(),
            epoch: run.epoch(),
            phase,
            sender: run.ctx().local,
            payload,
        };
        let action = match HookPoint::before_publish(phase) {
            Some(point) => self.observer.before_publish(point, run.ctx(), &mut message),
            None => HookAction::Continue,
        };
        run.submit_local(message.payload.clone())?;
        if action == HookAction::Withhold {
            debug!(
                "Withholding {} message for session {:?} epoch {}",
                phase,
                run.session_id(),
                run.epoch()
            );
            return Ok(());
        }
        self.notifier.publish(MixMessage::Phase(message))
    }

    fn offer(&self, run: &mut SessionRun, message: PhaseMessage, deferred: &mut Vec<PhaseMessage>) {
        if message.epoch > run.epoch() {
            // A peer already moved on to the next epoch.
            if deferred.len() < self.config.pending_message_limit {
                deferred.push(message);
            }
            return;
        }
        match run.submit(&message, self.crypto.as_ref()) {
            Submission::Accepted => trace!(
                "Accepted {} message from {:?}",
                message.phase,
                message.sender
            ),
            Submission::Faulted(_) => {}
            Submission::Ignored(reason) => debug!(
                "Ignored {} message from {:?}: {}",
                message.phase, message.sender, reason
            ),
        }
    }

    fn finish(
        &self,
        run: SessionRun,
        request: PairRequest,
        consumed: Vec<PairRequestId>,
        verdicts: Vec<BlameVerdict>,
    ) {
        let Some(transaction) = run.transaction().cloned() else {
            self.emit(MixOutcome::Failed {
                request,
                reason: FailureReason::Local(MixError::Crypto(
                    "run finished without a transaction".to_string(),
                )),
                verdicts,
            });
            return;
        };
        info!(
            "Session {:?} completed at epoch {}; transaction {}",
            run.session_id(),
            run.epoch(),
            hex::encode(transaction.hash())
        );
        let announcement = MixMessage::Announcement {
            session_id: run.session_id(),
            sender: self.local,
            tx_hash: transaction.hash(),
            consumed,
        };
        if let Err(e) = self.notifier.publish(announcement) {
            warn!("Failed to announce session {:?}: {}", run.session_id(), e);
        }
        self.emit(MixOutcome::Completed {
            request,
            session_id: run.session_id(),
            epoch: run.epoch(),
            transaction,
            verdicts,
        });
    }
}
