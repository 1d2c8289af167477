//! Pairing of compatible requests into sessions, and the output lock set.
//!
//! Requests are bucketed by denomination. Forming a session locks every output of every
//! member until the session completes, dissolves or is released, so one output is never
//! part of two running sessions.

use crate::blame::BlameVerdict;
use crate::crypto::RunContext;
use crate::error::MixError;
use crate::expiry::{is_expired, max_expiry, ChainParams};
use crate::message::PairRequest;
use crate::types::{tagged_hash, Denomination, OutputCommitment, PairRequestId, PeerId, SessionId};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// A deterministic grouping of pair requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    denomination: Denomination,
    /// Sorted by request id.
    requests: Vec<PairRequest>,
}

impl Session {
    /// Identifier for a set of requests. Order of `requests` does not matter.
    pub fn derive_id(requests: &[PairRequest]) -> SessionId {
        let mut ids: Vec<PairRequestId> = requests.iter().map(PairRequest::id).collect();
        ids.sort_unstable();
        ids.dedup();
        let count = (ids.len() as u64).to_le_bytes();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(ids.len() + 1);
        parts.push(&count);
        parts.extend(ids.iter().map(|id| id.as_bytes().as_slice()));
        SessionId(tagged_hash(b"mixclient/session/v1", &parts))
    }

    fn new(denomination: Denomination, mut requests: Vec<PairRequest>) -> Self {
        requests.sort_by_key(PairRequest::id);
        Self {
            id: Self::derive_id(&requests),
            denomination,
            requests,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn denomination(&self) -> Denomination {
        self.denomination
    }

    pub fn requests(&self) -> &[PairRequest] {
        &self.requests
    }

    /// Participant identities, sorted.
    pub fn participants(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.requests.iter().map(|r| *r.identity()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputCommitment> {
        self.requests.iter().flat_map(|r| r.outputs().iter())
    }
}

/// A session handed to a run.
#[derive(Debug, Clone)]
pub struct FormedSession {
    pub session: Session,
    pub epoch: u32,
    pub local: PairRequestId,
}

impl FormedSession {
    pub fn local_request(&self) -> Option<&PairRequest> {
        self.session.requests().iter().find(|r| r.id() == self.local)
    }

    pub fn context(&self) -> Option<RunContext> {
        let local = *self.local_request()?.identity();
        Some(RunContext {
            session_id: self.session.id(),
            epoch: self.epoch,
            local,
            participants: self.session.participants(),
        })
    }
}

/// What follows a blamed run.
#[derive(Debug, Clone)]
pub enum NextRun {
    /// Same participants, next epoch.
    Retry(FormedSession),
    /// Blamed participants removed, next epoch.
    Reformed(FormedSession),
    /// Too few participants remain; the local request is idle again.
    Dissolved(MixError),
}

#[derive(Debug, Clone)]
struct ActiveSession {
    denomination: Denomination,
    members: Vec<PairRequestId>,
    local: PairRequestId,
    epoch: u32,
}

#[derive(Debug)]
pub struct PairedSessions {
    min_participants: usize,
    chain: ChainParams,
    tip: u32,
    buckets: HashMap<Denomination, BTreeMap<PairRequestId, PairRequest>>,
    locked: HashMap<OutputCommitment, SessionId>,
    active: HashMap<SessionId, ActiveSession>,
    /// Requests removed by a verdict, kept until their expiry so they cannot rejoin.
    excluded: HashMap<PairRequestId, u32>,
    local: HashSet<PairRequestId>,
}

impl PairedSessions {
    pub fn new(min_participants: usize, chain: ChainParams, tip: u32) -> Self {
        Self {
            min_participants,
            chain,
            tip,
            buckets: HashMap::new(),
            locked: HashMap::new(),
            active: HashMap::new(),
            excluded: HashMap::new(),
            local: HashSet::new(),
        }
    }

    pub fn tip(&self) -> u32 {
        self.tip
    }

    pub fn max_expiry(&self) -> u32 {
        max_expiry(self.tip, &self.chain)
    }

    /// Admits a request into its denomination bucket.
    pub fn accept(&mut self, request: PairRequest, local: bool) -> Result<PairRequestId, MixError> {
        request.check()?;
        let id = request.id();
        if is_expired(request.expiry(), self.tip) {
            return Err(MixError::Expired {
                expiry: request.expiry(),
                tip: self.tip,
            });
        }
        let max = self.max_expiry();
        if request.expiry() > max {
            return Err(MixError::ExpiryTooFar {
                expiry: request.expiry(),
                max,
            });
        }
        if self.excluded.contains_key(&id) {
            return Err(MixError::Excluded(id));
        }
        for output in request.outputs() {
            if self.locked.contains_key(output) {
                return Err(MixError::OutputLocked(*output));
            }
        }

        if let Some(bucket) = self.buckets.get(&request.denomination()) {
            if bucket.contains_key(&id) {
                return Err(MixError::DuplicateRequest(id));
            }
            if bucket.values().any(|r| r.identity() == request.identity()) {
                return Err(MixError::DuplicateIdentity(*request.identity()));
            }
        }
        // No output may be offered by two pooled requests, whatever their denomination.
        for other in self.buckets.values().flat_map(|b| b.values()) {
            let shared = request
                .outputs()
                .iter()
                .find(|o| other.outputs().contains(*o));
            if let Some(output) = shared {
                return Err(MixError::OutputConflict(*output));
            }
        }

        debug!(
            "Accepted pair request {:?} from {:?} ({} outputs, denomination {}, expiry {})",
            id,
            request.identity(),
            request.outputs().len(),
            request.denomination(),
            request.expiry()
        );
        if local {
            self.local.insert(id);
        }
        self.buckets
            .entry(request.denomination())
            .or_default()
            .insert(id, request);
        Ok(id)
    }

    pub fn request(&self, id: &PairRequestId) -> Option<&PairRequest> {
        self.buckets.values().find_map(|b| b.get(id))
    }

    pub fn is_local(&self, id: &PairRequestId) -> bool {
        self.local.contains(id)
    }

    /// Local requests not currently part of an active session.
    pub fn idle_local(&self) -> Vec<PairRequestId> {
        let busy: HashSet<PairRequestId> = self.active.values().map(|a| a.local).collect();
        let mut ids: Vec<PairRequestId> = self
            .local
            .iter()
            .filter(|id| !busy.contains(id))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_locked(&self, output: &OutputCommitment) -> bool {
        self.locked.contains_key(output)
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    /// Forms a session around the local request from everything pairable in its bucket.
    pub fn form_session(&mut self, local: &PairRequestId) -> Result<FormedSession, MixError> {
        let request = self
            .request(local)
            .cloned()
            .ok_or(MixError::UnknownRequest(*local))?;
        if let Some(output) = request.outputs().iter().find(|o| self.is_locked(*o)) {
            return Err(MixError::OutputLocked(*output));
        }
        let candidates: Vec<PairRequest> = self
            .buckets
            .get(&request.denomination())
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|r| !r.outputs().iter().any(|o| self.is_locked(o)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.form_session_from(candidates, local, 0)
    }

    /// Forms a session from an explicit candidate set.
    ///
    /// Fails if a candidate's outputs are locked or collide, or if fewer than the minimum
    /// number of participants remain after dropping expired and excluded requests.
    pub fn form_session_from(
        &mut self,
        candidates: Vec<PairRequest>,
        local: &PairRequestId,
        epoch: u32,
    ) -> Result<FormedSession, MixError> {
        let mut unique: BTreeMap<PairRequestId, PairRequest> = BTreeMap::new();
        for request in candidates {
            unique.entry(request.id()).or_insert(request);
        }

        let local_request = unique
            .get(local)
            .cloned()
            .ok_or(MixError::UnknownRequest(*local))?;
        if is_expired(local_request.expiry(), self.tip) {
            return Err(MixError::Expired {
                expiry: local_request.expiry(),
                tip: self.tip,
            });
        }

        let mut seen_outputs = HashSet::new();
        let mut seen_identities = HashSet::new();
        let mut members = Vec::with_capacity(unique.len());
        for (id, request) in unique {
            if request.denomination() != local_request.denomination() {
                continue;
            }
            if self.excluded.contains_key(&id) || is_expired(request.expiry(), self.tip) {
                continue;
            }
            for output in request.outputs() {
                if self.locked.contains_key(output) {
                    return Err(MixError::OutputLocked(*output));
                }
                if !seen_outputs.insert(*output) {
                    return Err(MixError::OutputConflict(*output));
                }
            }
            if !seen_identities.insert(*request.identity()) {
                return Err(MixError::DuplicateIdentity(*request.identity()));
            }
            members.push(request);
        }

        if members.len() < self.min_participants {
            return Err(MixError::InsufficientPeers {
                have: members.len(),
                need: self.min_participants,
            });
        }

        let session = Session::new(local_request.denomination(), members);
        let id = session.id();
        for output in session.outputs() {
            self.locked.insert(*output, id);
        }
        self.active.insert(
            id,
            ActiveSession {
                denomination: session.denomination(),
                members: session.requests().iter().map(PairRequest::id).collect(),
                local: *local,
                epoch,
            },
        );
        info!(
            "Formed session {:?} epoch {} with {} participants (denomination {})",
            id,
            epoch,
            session.requests().len(),
            session.denomination()
        );
        Ok(FormedSession {
            session,
            epoch,
            local: *local,
        })
    }

    /// Applies the verdict of a blamed run and forms the next epoch.
    pub fn apply_verdict(&mut self, verdict: &BlameVerdict) -> Result<NextRun, MixError> {
        let active = self
            .release_locks(&verdict.session_id)
            .ok_or(MixError::UnknownSession(verdict.session_id))?;

        let mut remaining = Vec::with_capacity(active.members.len());
        for id in &active.members {
            let Some(request) = self.request(id).cloned() else {
                continue;
            };
            if *id != active.local && verdict.contains(request.identity()) {
                self.exclude(&active.denomination, id, request.expiry());
                continue;
            }
            remaining.push(request);
        }

        let epoch = active.epoch + 1;
        match self.form_session_from(remaining, &active.local, epoch) {
            Ok(formed) if formed.session.id() == verdict.session_id => Ok(NextRun::Retry(formed)),
            Ok(formed) => Ok(NextRun::Reformed(formed)),
            Err(e) => {
                info!(
                    "Session {:?} dissolved after epoch {}: {}",
                    verdict.session_id, active.epoch, e
                );
                Ok(NextRun::Dissolved(e))
            }
        }
    }

    /// Retries a session with identical participants, e.g. after a no-fault verdict.
    pub fn retry(&mut self, session_id: &SessionId) -> Result<NextRun, MixError> {
        let active = self
            .release_locks(session_id)
            .ok_or(MixError::UnknownSession(*session_id))?;
        let members: Vec<PairRequest> = active
            .members
            .iter()
            .filter_map(|id| self.request(id).cloned())
            .collect();
        match self.form_session_from(members, &active.local, active.epoch + 1) {
            Ok(formed) if formed.session.id() == *session_id => Ok(NextRun::Retry(formed)),
            Ok(formed) => Ok(NextRun::Reformed(formed)),
            Err(e) => Ok(NextRun::Dissolved(e)),
        }
    }

    /// The session completed: its requests are consumed and its outputs unlocked.
    pub fn complete(&mut self, session_id: &SessionId) -> Vec<PairRequestId> {
        let Some(active) = self.release_locks(session_id) else {
            return Vec::new();
        };
        for id in &active.members {
            self.remove_request(&active.denomination, id);
        }
        active.members
    }

    /// Unlocks a session's outputs without consuming anything.
    pub fn release(&mut self, session_id: &SessionId) -> bool {
        self.release_locks(session_id).is_some()
    }

    /// Drops remote requests another node reported as consumed by `session_id`. Local
    /// requests are only consumed by our own completed sessions.
    ///
    /// The session must be one this node is running, in which case only its members are
    /// dropped, or one whose id derives from the listed requests.
    pub fn consume(
        &mut self,
        session_id: &SessionId,
        ids: &[PairRequestId],
    ) -> Result<usize, MixError> {
        let ids: Vec<PairRequestId> = match self.active.get(session_id) {
            Some(active) => ids
                .iter()
                .filter(|id| active.members.contains(*id))
                .copied()
                .collect(),
            None if self.derives(session_id, ids) => ids.to_vec(),
            None => return Err(MixError::UnknownSession(*session_id)),
        };
        let mut removed = 0;
        for id in &ids {
            if self.local.contains(id) {
                continue;
            }
            if let Some(denomination) = self.request(id).map(PairRequest::denomination) {
                self.remove_request(&denomination, id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Advances the tip and drops idle requests and exclusions that expired.
    /// Returns the local requests that were dropped.
    pub fn set_tip(&mut self, height: u32) -> Vec<PairRequest> {
        self.tip = height;
        self.excluded.retain(|_, expiry| !is_expired(*expiry, height));

        let busy: HashSet<PairRequestId> = self
            .active
            .values()
            .flat_map(|a| a.members.iter().copied())
            .collect();
        let mut expired_local = Vec::new();
        for bucket in self.buckets.values_mut() {
            bucket.retain(|id, request| {
                if busy.contains(id) || !is_expired(request.expiry(), height) {
                    return true;
                }
                if self.local.remove(id) {
                    expired_local.push(request.clone());
                }
                false
            });
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        expired_local
    }

    /// Drops every request offering one of `outputs`. Returns the active sessions that held
    /// any of them and the local requests that were dropped.
    pub fn remove_spent(
        &mut self,
        outputs: &[OutputCommitment],
    ) -> (Vec<SessionId>, Vec<PairRequest>) {
        let spent: HashSet<&OutputCommitment> = outputs.iter().collect();
        let mut sessions: Vec<SessionId> = outputs
            .iter()
            .filter_map(|o| self.locked.get(o).copied())
            .collect();
        sessions.sort_unstable();
        sessions.dedup();

        let mut dropped_local = Vec::new();
        for bucket in self.buckets.values_mut() {
            bucket.retain(|id, request| {
                if !request.outputs().iter().any(|o| spent.contains(o)) {
                    return true;
                }
                if self.local.remove(id) {
                    dropped_local.push(request.clone());
                }
                false
            });
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        (sessions, dropped_local)
    }

    /// Every listed request is pooled here and together they hash to `session_id`.
    fn derives(&self, session_id: &SessionId, ids: &[PairRequestId]) -> bool {
        let requests: Option<Vec<PairRequest>> =
            ids.iter().map(|id| self.request(id).cloned()).collect();
        requests.is_some_and(|r| !r.is_empty() && Session::derive_id(&r) == *session_id)
    }

    fn exclude(&mut self, denomination: &Denomination, id: &PairRequestId, expiry: u32) {
        debug!("Excluding pair request {:?} until height {}", id, expiry);
        self.remove_request(denomination, id);
        self.excluded.insert(*id, expiry);
    }

    fn remove_request(&mut self, denomination: &Denomination, id: &PairRequestId) {
        if let Some(bucket) = self.buckets.get_mut(denomination) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.buckets.remove(denomination);
            }
        }
        self.local.remove(id);
    }

    fn release_locks(&mut self, session_id: &SessionId) -> Option<ActiveSession> {
        let active = self.active.remove(session_id)?;
        self.locked.retain(|_, owner| owner != session_id);
        Some(active)
    }
}
