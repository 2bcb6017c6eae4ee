//! Host-driven handshake coordinator: the host passes decoded datagrams in and
//! performs the returned actions. No I/O happens here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::digest::{equal_fingerprints, fingerprint};
use crate::protocol::{
    Acknowledgment, Challenge, Confirmation, ErrorReport, Kind, Message, Push, SchemaError,
    Status,
};
use crate::registry::{
    CorrelationKey, InboundPhase, OutboundPhase, Outcome, Registry, Transaction,
    DEFAULT_INBOUND_TTL,
};
use crate::session::{Credentials, Session};
use crate::wire::Decoded;

/// Reason sent with a cancelled acknowledgment when the peer reported a digest mismatch.
pub const NOTE_MISMATCH: &str = "Frequency mismatch detected by peer.";
/// Reason sent when a confirmation names nothing we have cached.
pub const NOTE_NO_PENDING: &str = "No pending action found for this confirmation.";

/// Something the host must do after feeding the coordinator a datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Encode with the active key and send back to the datagram's source.
    Send(Message),
    /// A confirmed push; hand the text to the domain layer.
    Deliver(Delivery),
}

/// Verified inbound content. `text` is exactly what was received.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub transaction_id: String,
    pub action: String,
    pub text: Arc<str>,
}

/// Drives both handshake directions against a shared registry and session.
pub struct Coordinator {
    registry: Arc<Registry>,
    session: Arc<Session>,
    inbound_ttl: Duration,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, session: Arc<Session>) -> Self {
        Self {
            registry,
            session,
            inbound_ttl: DEFAULT_INBOUND_TTL,
        }
    }

    /// How long a pushed payload waits for the peer's confirmation.
    pub fn set_inbound_ttl(&mut self, ttl: Duration) {
        self.inbound_ttl = ttl;
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Dispatch one decoded datagram by action. A schema error means the datagram
    /// is dropped; nothing in the registry changes.
    pub fn on_datagram(&self, decoded: &Decoded) -> Result<Vec<Action>, SchemaError> {
        let msg = &decoded.message;
        match msg.kind() {
            Kind::DigestChallenge => Ok(self.on_challenge(Challenge::from_message(msg)?)),
            Kind::Confirm => Ok(self.on_confirmation(Confirmation::from_message(msg)?)),
            Kind::Ack => {
                self.on_ack(Acknowledgment::from_message(msg)?);
                Ok(Vec::new())
            }
            Kind::Error => {
                self.on_error(ErrorReport::from_message(msg));
                Ok(Vec::new())
            }
            Kind::Push(_) => self.on_push(msg, &decoded.text),
        }
    }

    /// Outbound phase 1: the peer says what it decoded. Bind its transaction id to
    /// our oldest matching request and answer with the comparison result.
    pub fn on_challenge(&self, challenge: Challenge) -> Vec<Action> {
        let remote = CorrelationKey::Remote(challenge.transaction_id.clone());
        if let Some(tx) = self.registry.get(&remote) {
            debug!(transaction_id = %challenge.transaction_id, "repeated challenge, answering again");
            return vec![confirm_for(&tx, challenge)];
        }

        let now = Instant::now();
        let Some(candidate) = self
            .registry
            .find_by_kind_label(&challenge.original_action, |tx| tx.deadline > now)
        else {
            warn!(
                transaction_id = %challenge.transaction_id,
                original_action = %challenge.original_action,
                "challenge matches no pending request"
            );
            return Vec::new();
        };
        let Some(temp_key) = candidate.temp_key else {
            return Vec::new();
        };

        let tx = match self.registry.bind_remote_id(temp_key, &challenge.transaction_id) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "challenge not bound");
                return Vec::new();
            }
        };
        let action = confirm_for(&tx, challenge);
        self.registry.advance(&tx.key, OutboundPhase::ConfirmSent);
        vec![action]
    }

    /// Outbound phase 3: the peer's final word. Adopts session credentials before the
    /// waiter is woken, so the submitter sees the session as soon as it sees success.
    pub fn on_ack(&self, ack: Acknowledgment) {
        let key = CorrelationKey::Remote(ack.transaction_id.clone());
        let Some(tx) = self.registry.get(&key) else {
            warn!(
                transaction_id = %ack.transaction_id,
                status = %ack.status,
                "ack for unknown or finished transaction"
            );
            return;
        };

        let outcome = match ack.status {
            Status::Success if self.session.is_establishing(&tx.kind_label) => {
                match Credentials::from_ack_data(&ack.data) {
                    Some(credentials) => {
                        let chat_id = credentials.chat_id.clone();
                        if self.session.establish(credentials) {
                            info!(chat_id = %chat_id, "session established");
                        } else {
                            warn!("session already established, keeping existing credentials");
                        }
                        Outcome::Acknowledged { data: ack.data }
                    }
                    None => {
                        error!(
                            transaction_id = %ack.transaction_id,
                            "session acknowledgment without session_key or chatid"
                        );
                        Outcome::Rejected {
                            status: Status::Failure,
                            reason: "session acknowledgment missing credentials".into(),
                        }
                    }
                }
            }
            Status::Success => Outcome::Acknowledged { data: ack.data },
            status => Outcome::Rejected {
                status,
                reason: ack.note.unwrap_or_else(|| "No details".into()),
            },
        };

        debug!(transaction_id = %ack.transaction_id, kind = %tx.kind_label, "ack received");
        if !self.registry.resolve(&key, outcome) {
            debug!(transaction_id = %ack.transaction_id, "transaction finished before ack was applied");
        }
    }

    /// Explicit error. Correlated by transaction id when present, else by the oldest
    /// unbound request of the named action.
    pub fn on_error(&self, report: ErrorReport) {
        warn!(
            transaction_id = report.transaction_id.as_deref().unwrap_or("-"),
            original_action = report.original_action.as_deref().unwrap_or("-"),
            note = report.note.as_deref().unwrap_or("-"),
            "peer reported error"
        );
        let by_id = report
            .transaction_id
            .as_ref()
            .map(|id| CorrelationKey::Remote(id.clone()))
            .filter(|key| self.registry.get(key).is_some());
        let key = by_id.or_else(|| {
            let action = report.original_action.as_deref()?;
            self.registry
                .find_by_kind_label(action, |_| true)
                .map(|tx| tx.key)
        });
        let Some(key) = key else {
            debug!("error matches no pending request");
            return;
        };
        let reason = report
            .note
            .unwrap_or_else(|| "Unknown server error".into());
        self.registry.resolve(
            &key,
            Outcome::Rejected {
                status: Status::Error,
                reason,
            },
        );
    }

    /// Inbound phase 1: cache the pushed text and challenge the peer with its fingerprint.
    /// A repeated push is challenged again with the originally cached text.
    pub fn on_push(&self, msg: &Message, text: &str) -> Result<Vec<Action>, SchemaError> {
        let push = Push::from_message(msg)?;
        let id = push.transaction_id.as_str();

        let fresh = self
            .registry
            .register_inbound(id, &push.action, text, self.inbound_ttl);
        let payload: Arc<str> = if fresh {
            debug!(transaction_id = %id, action = %push.action, "push received");
            Arc::from(text)
        } else {
            match self.registry.inbound(id) {
                Some(tx) => {
                    debug!(transaction_id = %id, "repeated push, challenging again");
                    tx.raw_payload
                }
                None => {
                    debug!(transaction_id = %id, "push for already consumed transaction");
                    return Ok(Vec::new());
                }
            }
        };

        self.registry.advance_inbound(id, InboundPhase::ChallengeSent);
        let challenge = Challenge {
            transaction_id: push.transaction_id,
            fingerprint: fingerprint(&payload),
            original_action: push.action,
        };
        Ok(vec![Action::Send(challenge.into_message())])
    }

    /// Inbound phase 2: the peer compared our fingerprint with what it sent.
    pub fn on_confirmation(&self, confirmation: Confirmation) -> Vec<Action> {
        let id = confirmation.transaction_id;
        let cached = self.registry.take_inbound(&id);

        if !confirmation.confirm {
            warn!(transaction_id = %id, "peer reported digest mismatch, discarding push");
            return vec![Action::Send(Acknowledgment::reply(
                &id,
                Status::Cancelled,
                Some(NOTE_MISMATCH.into()),
            ))];
        }

        match cached {
            Some(tx) => {
                info!(transaction_id = %id, action = %tx.kind_label, "push confirmed");
                vec![
                    Action::Deliver(Delivery {
                        transaction_id: id.clone(),
                        action: tx.kind_label,
                        text: tx.raw_payload,
                    }),
                    Action::Send(Acknowledgment::reply(&id, Status::Success, None)),
                ]
            }
            None => {
                warn!(transaction_id = %id, "confirmation for nothing cached");
                vec![Action::Send(Acknowledgment::reply(
                    &id,
                    Status::Failure,
                    Some(NOTE_NO_PENDING.into()),
                ))]
            }
        }
    }
}

/// Confirmation for `tx`: does the peer's fingerprint match what we actually sent?
fn confirm_for(tx: &Transaction, challenge: Challenge) -> Action {
    let matched = equal_fingerprints(&fingerprint(&tx.raw_payload), &challenge.fingerprint);
    if matched {
        debug!(transaction_id = %challenge.transaction_id, "digest matches");
    } else {
        warn!(transaction_id = %challenge.transaction_id, kind = %tx.kind_label, "digest mismatch");
    }
    Action::Send(
        Confirmation {
            transaction_id: challenge.transaction_id,
            confirm: matched,
        }
        .into_message(),
    )
}
