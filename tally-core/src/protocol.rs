//! Tally wire protocol: message envelope, reserved actions, typed views over `data`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest::Fingerprint;

/// Digest challenge: "this is the fingerprint of what I decoded".
pub const ACTION_CHALLENGE: &str = "character_count";
/// Confirmation: carries the boolean outcome of the digest comparison.
pub const ACTION_CONFIRM: &str = "confirm_count";
/// Terminal acknowledgment of either flow.
pub const ACTION_ACK: &str = "ack";
/// Explicit failure report.
pub const ACTION_ERROR: &str = "error";

pub const KEY_TRANSACTION_ID: &str = "transaction_id";
pub const KEY_LETTER_FREQUENCIES: &str = "letter_frequencies";
pub const KEY_CONFIRM: &str = "confirm";
pub const KEY_ORIGINAL_ACTION: &str = "original_action";

/// Final status carried by replies and acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Error,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One datagram's worth of protocol. Encoding is JSON; see the wire module for the transform.
///
/// Top-level fields the protocol does not know about are kept in `extra` so a
/// decoded message re-serializes to the same structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Free-text diagnostic. Named `message` on the wire.
    #[serde(default, rename = "message", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classification of a message by its `action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind<'a> {
    DigestChallenge,
    Confirm,
    Ack,
    Error,
    /// Anything that is not a control action: domain content pushed at us.
    Push(&'a str),
}

impl Message {
    /// Request-shaped message: action plus optional data, no status.
    pub fn request(action: impl Into<String>, data: Option<Map<String, Value>>) -> Self {
        Self {
            action: action.into(),
            status: None,
            note: None,
            data,
            extra: Map::new(),
        }
    }

    /// Reply-shaped message: action, status, optional note and data.
    pub fn reply(
        action: impl Into<String>,
        status: Status,
        note: Option<String>,
        data: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            action: action.into(),
            status: Some(status),
            note,
            data,
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> Kind<'_> {
        match self.action.as_str() {
            ACTION_CHALLENGE => Kind::DigestChallenge,
            ACTION_CONFIRM => Kind::Confirm,
            ACTION_ACK => Kind::Ack,
            ACTION_ERROR => Kind::Error,
            other => Kind::Push(other),
        }
    }

    /// `data.transaction_id`, if present and a string.
    pub fn transaction_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get(KEY_TRANSACTION_ID))
            .and_then(Value::as_str)
    }

    fn data_or_missing(&self) -> Result<&Map<String, Value>, SchemaError> {
        self.data.as_ref().ok_or_else(|| SchemaError::MissingData {
            action: self.action.clone(),
        })
    }

    fn require_str(&self, data: &Map<String, Value>, field: &'static str) -> Result<String, SchemaError> {
        match data.get(field) {
            None => Err(SchemaError::MissingField {
                action: self.action.clone(),
                field,
            }),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(SchemaError::InvalidField {
                action: self.action.clone(),
                field,
            }),
        }
    }
}

/// Reserved fields missing or mistyped for the message's kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("{action}: missing 'data' object")]
    MissingData { action: String },
    #[error("{action}: missing field '{field}'")]
    MissingField { action: String, field: &'static str },
    #[error("{action}: field '{field}' has the wrong type")]
    InvalidField { action: String, field: &'static str },
    #[error("{action}: missing status")]
    MissingStatus { action: String },
}

/// Digest challenge: `data { transaction_id, letter_frequencies, original_action }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub transaction_id: String,
    pub fingerprint: Fingerprint,
    pub original_action: String,
}

impl Challenge {
    pub fn from_message(msg: &Message) -> Result<Self, SchemaError> {
        let data = msg.data_or_missing()?;
        let transaction_id = msg.require_str(data, KEY_TRANSACTION_ID)?;
        let original_action = msg.require_str(data, KEY_ORIGINAL_ACTION)?;
        let fingerprint = match data.get(KEY_LETTER_FREQUENCIES) {
            Some(Value::Object(map)) => Fingerprint::from_wire(map),
            Some(_) => {
                return Err(SchemaError::InvalidField {
                    action: msg.action.clone(),
                    field: KEY_LETTER_FREQUENCIES,
                })
            }
            None => {
                return Err(SchemaError::MissingField {
                    action: msg.action.clone(),
                    field: KEY_LETTER_FREQUENCIES,
                })
            }
        };
        Ok(Self {
            transaction_id,
            fingerprint,
            original_action,
        })
    }

    pub fn into_message(self) -> Message {
        let mut data = Map::new();
        data.insert(KEY_TRANSACTION_ID.into(), Value::String(self.transaction_id));
        data.insert(
            KEY_LETTER_FREQUENCIES.into(),
            Value::Object(self.fingerprint.to_wire()),
        );
        data.insert(
            KEY_ORIGINAL_ACTION.into(),
            Value::String(self.original_action),
        );
        Message::request(ACTION_CHALLENGE, Some(data))
    }
}

/// Confirmation: `data { transaction_id, confirm }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub transaction_id: String,
    pub confirm: bool,
}

impl Confirmation {
    pub fn from_message(msg: &Message) -> Result<Self, SchemaError> {
        let data = msg.data_or_missing()?;
        let transaction_id = msg.require_str(data, KEY_TRANSACTION_ID)?;
        let confirm = match data.get(KEY_CONFIRM) {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(SchemaError::InvalidField {
                    action: msg.action.clone(),
                    field: KEY_CONFIRM,
                })
            }
            None => {
                return Err(SchemaError::MissingField {
                    action: msg.action.clone(),
                    field: KEY_CONFIRM,
                })
            }
        };
        Ok(Self {
            transaction_id,
            confirm,
        })
    }

    pub fn into_message(self) -> Message {
        let mut data = Map::new();
        data.insert(KEY_TRANSACTION_ID.into(), Value::String(self.transaction_id));
        data.insert(KEY_CONFIRM.into(), Value::Bool(self.confirm));
        Message::request(ACTION_CONFIRM, Some(data))
    }
}

/// Acknowledgment: `status`, optional `message`, `data { transaction_id, .. }`.
/// The full `data` object is kept; it carries domain results (and session credentials).
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgment {
    pub transaction_id: String,
    pub status: Status,
    pub note: Option<String>,
    pub original_action: Option<String>,
    pub data: Map<String, Value>,
}

impl Acknowledgment {
    pub fn from_message(msg: &Message) -> Result<Self, SchemaError> {
        let status = msg.status.ok_or_else(|| SchemaError::MissingStatus {
            action: msg.action.clone(),
        })?;
        let data = msg.data_or_missing()?;
        let transaction_id = msg.require_str(data, KEY_TRANSACTION_ID)?;
        let original_action = data
            .get(KEY_ORIGINAL_ACTION)
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(Self {
            transaction_id,
            status,
            note: msg.note.clone(),
            original_action,
            data: data.clone(),
        })
    }

    /// Acknowledgment we send at the end of an inbound flow.
    pub fn reply(transaction_id: &str, status: Status, note: Option<String>) -> Message {
        let mut data = Map::new();
        data.insert(KEY_TRANSACTION_ID.into(), Value::String(transaction_id.to_owned()));
        Message::reply(ACTION_ACK, status, note, Some(data))
    }
}

/// Domain content pushed at us. Only the correlation id is reserved; the rest of
/// `data` is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub transaction_id: String,
    pub action: String,
}

impl Push {
    pub fn from_message(msg: &Message) -> Result<Self, SchemaError> {
        let data = msg.data_or_missing()?;
        Ok(Self {
            transaction_id: msg.require_str(data, KEY_TRANSACTION_ID)?,
            action: msg.action.clone(),
        })
    }
}

/// Explicit error. Every field is optional; peers put `original_action`
/// either inside `data` or at the top level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub transaction_id: Option<String>,
    pub original_action: Option<String>,
    pub note: Option<String>,
}

impl ErrorReport {
    pub fn from_message(msg: &Message) -> Self {
        let original_action = msg
            .data
            .as_ref()
            .and_then(|d| d.get(KEY_ORIGINAL_ACTION))
            .or_else(|| msg.extra.get(KEY_ORIGINAL_ACTION))
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            transaction_id: msg.transaction_id().map(str::to_owned),
            original_action,
            note: msg.note.clone(),
        }
    }
}
