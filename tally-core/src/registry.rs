//! Transaction registry: every in-flight handshake, indexed by correlation key.
//!
//! Outbound transactions start under a locally generated temporary key and move
//! to the remote-assigned transaction id once the peer's challenge names it.
//! Inbound transactions are keyed by the remote id from the start.
//!
//! All tables sit behind a single mutex that is never held across I/O. Whoever
//! removes an outbound entry from the tables owns its resolution; every other
//! contender sees a miss, which is a normal outcome and not an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::Status;

/// How long an outbound request waits for its acknowledgment.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a pushed payload stays cached waiting for the peer's confirmation.
pub const DEFAULT_INBOUND_TTL: Duration = Duration::from_secs(60);

/// How long a remote id stays reserved after its transaction is gone, so a
/// retransmitted challenge cannot bind it to a newer request.
pub const RETIRED_ID_RETENTION: Duration = Duration::from_secs(60);

/// Longest wait any deadline is allowed to express. Larger timeouts are clamped.
pub const MAX_WAIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Reason given to waiters rejected because the registry was cleared.
pub const SHUTDOWN_REASON: &str = "client shutting down";

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait.min(MAX_WAIT)).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Generated locally before the peer has assigned an id.
    Temp(Uuid),
    /// Assigned by the peer.
    Remote(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Temp(t) => write!(f, "temp:{}", t),
            CorrelationKey::Remote(r) => write!(f, "remote:{}", r),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We sent a request; the peer challenges us.
    Outbound,
    /// The peer pushed content; we challenge it.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutboundPhase {
    Sent,
    AwaitingChallenge,
    ChallengeReceived,
    ConfirmSent,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InboundPhase {
    PushReceived,
    ChallengeSent,
    ConfirmReceived,
    AckSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Outbound(OutboundPhase),
    Inbound(InboundPhase),
}

/// Terminal result of an outbound transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The peer acknowledged with success; `data` is the acknowledgment's data object.
    Acknowledged { data: Map<String, Value> },
    /// The peer acknowledged with a non-success status, or sent an explicit error.
    Rejected { status: Status, reason: String },
    /// No acknowledgment before the deadline.
    TimedOut,
}

impl Outcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Outcome::Acknowledged { .. })
    }
}

/// Point-in-time copy of a transaction's state.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub key: CorrelationKey,
    pub direction: Direction,
    /// Outbound only.
    pub temp_key: Option<Uuid>,
    pub remote_id: Option<String>,
    pub kind_label: String,
    /// Exact pre-transform text sent (outbound) or received (inbound).
    pub raw_payload: Arc<str>,
    pub phase: Phase,
    pub deadline: Instant,
}

/// Handle returned to the submitter of an outbound request.
#[derive(Debug)]
pub struct Pending {
    pub temp_key: Uuid,
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<Outcome>,
}

impl Pending {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::Temp(self.temp_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No live transaction for the key: already resolved, timed out, or never existed.
    #[error("no pending transaction for {0}")]
    CorrelationMiss(CorrelationKey),
    #[error("remote transaction id {0} is already bound")]
    AlreadyBound(String),
}

struct OutboundEntry {
    seq: u64,
    temp_key: Uuid,
    remote_id: Option<String>,
    kind_label: String,
    raw_payload: Arc<str>,
    phase: OutboundPhase,
    deadline: Instant,
    waiter: Option<oneshot::Sender<Outcome>>,
}

impl OutboundEntry {
    fn snapshot(&self) -> Transaction {
        let key = match &self.remote_id {
            Some(r) => CorrelationKey::Remote(r.clone()),
            None => CorrelationKey::Temp(self.temp_key),
        };
        Transaction {
            key,
            direction: Direction::Outbound,
            temp_key: Some(self.temp_key),
            remote_id: self.remote_id.clone(),
            kind_label: self.kind_label.clone(),
            raw_payload: self.raw_payload.clone(),
            phase: Phase::Outbound(self.phase),
            deadline: self.deadline,
        }
    }

    /// Terminal step. The receiver may already be gone (caller gave up); that is fine.
    fn finish(mut self, outcome: Outcome) -> Transaction {
        self.phase = OutboundPhase::Resolved;
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome);
        }
        self.snapshot()
    }
}

struct InboundEntry {
    remote_id: String,
    kind_label: String,
    raw_payload: Arc<str>,
    phase: InboundPhase,
    deadline: Instant,
}

impl InboundEntry {
    fn snapshot(&self) -> Transaction {
        Transaction {
            key: CorrelationKey::Remote(self.remote_id.clone()),
            direction: Direction::Inbound,
            temp_key: None,
            remote_id: Some(self.remote_id.clone()),
            kind_label: self.kind_label.clone(),
            raw_payload: self.raw_payload.clone(),
            phase: Phase::Inbound(self.phase),
            deadline: self.deadline,
        }
    }
}

#[derive(Default)]
struct Tables {
    /// Outbound, no remote id yet.
    unbound: HashMap<Uuid, OutboundEntry>,
    /// Outbound, keyed by remote id.
    bound: HashMap<String, OutboundEntry>,
    /// Temp key → remote id for bound entries, so callers can always remove by temp key.
    aliases: HashMap<Uuid, String>,
    /// Remote ids whose outbound transaction is gone, with the time they may be forgotten.
    retired: HashMap<String, Instant>,
    inbound: HashMap<String, InboundEntry>,
    /// Inbound ids already consumed, with the time they may be forgotten.
    consumed: HashMap<String, Instant>,
    next_seq: u64,
    /// Set by `clear`; new outbound registrations are rejected on the spot.
    closed: bool,
}

impl Tables {
    fn outbound(&self, key: &CorrelationKey) -> Option<&OutboundEntry> {
        match key {
            CorrelationKey::Temp(t) => match self.unbound.get(t) {
                Some(e) => Some(e),
                None => self.bound.get(self.aliases.get(t)?),
            },
            CorrelationKey::Remote(r) => self.bound.get(r),
        }
    }

    fn outbound_mut(&mut self, key: &CorrelationKey) -> Option<&mut OutboundEntry> {
        match key {
            CorrelationKey::Temp(t) => {
                if self.unbound.contains_key(t) {
                    self.unbound.get_mut(t)
                } else {
                    let remote = self.aliases.get(t)?;
                    self.bound.get_mut(remote)
                }
            }
            CorrelationKey::Remote(r) => self.bound.get_mut(r),
        }
    }

    /// Remove an outbound entry from every index it appears in.
    fn take_outbound(&mut self, key: &CorrelationKey) -> Option<OutboundEntry> {
        let entry = match key {
            CorrelationKey::Temp(t) => match self.unbound.remove(t) {
                Some(e) => Some(e),
                None => {
                    let remote = self.aliases.remove(t)?;
                    self.bound.remove(&remote)
                }
            },
            CorrelationKey::Remote(r) => {
                let e = self.bound.remove(r)?;
                self.aliases.remove(&e.temp_key);
                Some(e)
            }
        }?;
        if let Some(remote) = &entry.remote_id {
            self.retired
                .insert(remote.clone(), Instant::now() + RETIRED_ID_RETENTION);
        }
        Some(entry)
    }
}

/// Concurrent store of in-flight transactions.
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Register an outbound request under a fresh temporary key. `raw_payload` is the
    /// exact text being sent; the peer's challenge is checked against it.
    ///
    /// After [`Registry::clear`] nothing is stored and the returned receiver already
    /// holds a `Rejected` outcome.
    pub fn register_outbound(
        &self,
        kind_label: &str,
        raw_payload: impl Into<Arc<str>>,
        timeout: Duration,
    ) -> Pending {
        let (tx, rx) = oneshot::channel();
        let temp_key = Uuid::new_v4();
        let deadline = deadline_after(timeout);
        let mut t = self.tables.lock();
        if t.closed {
            drop(t);
            let _ = tx.send(Outcome::Rejected {
                status: Status::Failure,
                reason: SHUTDOWN_REASON.into(),
            });
            return Pending {
                temp_key,
                deadline,
                receiver: rx,
            };
        }
        let seq = t.next_seq;
        t.next_seq = t.next_seq.wrapping_add(1);
        t.unbound.insert(
            temp_key,
            OutboundEntry {
                seq,
                temp_key,
                remote_id: None,
                kind_label: kind_label.to_owned(),
                raw_payload: raw_payload.into(),
                phase: OutboundPhase::Sent,
                deadline,
                waiter: Some(tx),
            },
        );
        Pending {
            temp_key,
            deadline,
            receiver: rx,
        }
    }

    /// Move an outbound transaction forward. Returns false if it is gone or already at/after `phase`.
    pub fn advance(&self, key: &CorrelationKey, phase: OutboundPhase) -> bool {
        let mut t = self.tables.lock();
        match t.outbound_mut(key) {
            Some(e) if e.phase < phase => {
                e.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// The request datagram left the socket.
    pub fn mark_sent(&self, temp_key: Uuid) -> bool {
        self.advance(
            &CorrelationKey::Temp(temp_key),
            OutboundPhase::AwaitingChallenge,
        )
    }

    /// Atomically move a transaction from its temporary key to `remote_id`.
    pub fn bind_remote_id(&self, temp_key: Uuid, remote_id: &str) -> Result<Transaction, RegistryError> {
        let mut guard = self.tables.lock();
        let t = &mut *guard;
        if t.bound.contains_key(remote_id) || t.retired.contains_key(remote_id) {
            return Err(RegistryError::AlreadyBound(remote_id.to_owned()));
        }
        let Some(mut entry) = t.unbound.remove(&temp_key) else {
            return Err(RegistryError::CorrelationMiss(CorrelationKey::Temp(temp_key)));
        };
        entry.remote_id = Some(remote_id.to_owned());
        entry.phase = entry.phase.max(OutboundPhase::ChallengeReceived);
        let snapshot = entry.snapshot();
        t.aliases.insert(temp_key, remote_id.to_owned());
        t.bound.insert(remote_id.to_owned(), entry);
        Ok(snapshot)
    }

    /// Oldest outbound transaction still waiting for a remote id whose kind label is
    /// `label` and which satisfies `predicate`. Linear scan; the unbound set is small.
    pub fn find_by_kind_label<F>(&self, label: &str, predicate: F) -> Option<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let t = self.tables.lock();
        t.unbound
            .values()
            .filter(|e| e.kind_label == label)
            .map(|e| (e.seq, e.snapshot()))
            .filter(|(_, tx)| predicate(tx))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, tx)| tx)
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<Transaction> {
        self.tables.lock().outbound(key).map(OutboundEntry::snapshot)
    }

    /// Resolve an outbound transaction: remove it from every index and hand `outcome`
    /// to the waiter. Returns false if someone else already resolved or removed it.
    pub fn resolve(&self, key: &CorrelationKey, outcome: Outcome) -> bool {
        let entry = self.tables.lock().take_outbound(key);
        match entry {
            Some(e) => {
                e.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an outbound transaction without resolving it. Idempotent: returns
    /// `None` if it was already gone.
    pub fn remove(&self, key: &CorrelationKey) -> Option<Transaction> {
        let entry = self.tables.lock().take_outbound(key)?;
        Some(entry.snapshot())
    }

    /// Cache a pushed payload. Returns false if `remote_id` is already cached (the
    /// existing payload is kept) or was consumed recently.
    pub fn register_inbound(
        &self,
        remote_id: &str,
        kind_label: &str,
        raw_payload: impl Into<Arc<str>>,
        ttl: Duration,
    ) -> bool {
        let mut t = self.tables.lock();
        if t.inbound.contains_key(remote_id) || t.consumed.contains_key(remote_id) {
            return false;
        }
        t.inbound.insert(
            remote_id.to_owned(),
            InboundEntry {
                remote_id: remote_id.to_owned(),
                kind_label: kind_label.to_owned(),
                raw_payload: raw_payload.into(),
                phase: InboundPhase::PushReceived,
                deadline: deadline_after(ttl),
            },
        );
        true
    }

    pub fn inbound(&self, remote_id: &str) -> Option<Transaction> {
        self.tables
            .lock()
            .inbound
            .get(remote_id)
            .map(InboundEntry::snapshot)
    }

    pub fn advance_inbound(&self, remote_id: &str, phase: InboundPhase) -> bool {
        let mut t = self.tables.lock();
        match t.inbound.get_mut(remote_id) {
            Some(e) if e.phase < phase => {
                e.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Consume a cached push. Only the first caller gets it.
    pub fn take_inbound(&self, remote_id: &str) -> Option<Transaction> {
        let mut t = self.tables.lock();
        let mut entry = t.inbound.remove(remote_id)?;
        t.consumed
            .insert(remote_id.to_owned(), Instant::now() + RETIRED_ID_RETENTION);
        entry.phase = entry.phase.max(InboundPhase::ConfirmReceived);
        Some(entry.snapshot())
    }

    /// Drop everything whose deadline has passed. Outbound waiters get `TimedOut`.
    pub fn expire(&self, now: Instant) -> Vec<CorrelationKey> {
        let mut expired_outbound = Vec::new();
        let mut keys = Vec::new();
        {
            let mut t = self.tables.lock();
            let overdue: Vec<CorrelationKey> = t
                .unbound
                .values()
                .chain(t.bound.values())
                .filter(|e| e.deadline <= now)
                .map(|e| CorrelationKey::Temp(e.temp_key))
                .collect();
            for key in overdue {
                if let Some(e) = t.take_outbound(&key) {
                    expired_outbound.push(e);
                }
            }
            let stale: Vec<String> = t
                .inbound
                .values()
                .filter(|e| e.deadline <= now)
                .map(|e| e.remote_id.clone())
                .collect();
            for id in stale {
                t.inbound.remove(&id);
                keys.push(CorrelationKey::Remote(id));
            }
            t.retired.retain(|_, until| *until > now);
            t.consumed.retain(|_, until| *until > now);
        }
        for e in expired_outbound {
            keys.push(e.finish(Outcome::TimedOut).key);
        }
        keys
    }

    /// Drop every transaction and refuse new outbound ones. Outbound waiters are
    /// told the client is going away.
    pub fn clear(&self) {
        let (outbound, inbound) = {
            let mut guard = self.tables.lock();
            let t = &mut *guard;
            t.closed = true;
            t.aliases.clear();
            t.retired.clear();
            t.consumed.clear();
            let outbound: Vec<OutboundEntry> = t
                .unbound
                .drain()
                .map(|(_, e)| e)
                .chain(t.bound.drain().map(|(_, e)| e))
                .collect();
            let inbound = t.inbound.len();
            t.inbound.clear();
            (outbound, inbound)
        };
        tracing::debug!(outbound = outbound.len(), inbound, "clearing registry");
        for e in outbound {
            e.finish(Outcome::Rejected {
                status: Status::Failure,
                reason: SHUTDOWN_REASON.into(),
            });
        }
    }

    pub fn len_outbound(&self) -> usize {
        let t = self.tables.lock();
        t.unbound.len() + t.bound.len()
    }

    pub fn len_inbound(&self) -> usize {
        self.tables.lock().inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len_outbound() == 0 && self.len_inbound() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
