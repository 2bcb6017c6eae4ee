//! Datagram codec: JSON text, keyed transform, one message per datagram.

use serde_json::Value;

use crate::cipher::{self, CipherError};
use crate::protocol::Message;

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header).
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Serialize a message to the exact text that will be transformed and sent.
/// This text is what the peer's digest challenge is computed over.
pub fn to_text(msg: &Message) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(msg)?)
}

/// Transform `text` with `key` and enforce the datagram size limit.
pub fn seal(text: &str, key: &str) -> Result<Vec<u8>, EncodeError> {
    let out = cipher::encrypt(text, key).map_err(|CipherError::EmptyKey| EncodeError::MissingKey)?;
    if out.len() > MAX_DATAGRAM_SIZE {
        return Err(EncodeError::TooLarge {
            size: out.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(out.into_bytes())
}

/// Encode a message into a single datagram.
pub fn encode(msg: &Message, key: &str) -> Result<Vec<u8>, EncodeError> {
    seal(&to_text(msg)?, key)
}

/// Error encoding a message (missing key, serde failure, or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("transform key is empty")]
    MissingKey,
    #[error("encode error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("datagram too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// A decoded datagram: the parsed message and the exact text it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: Message,
    pub text: String,
}

/// Decode one datagram with `key`.
pub fn decode(bytes: &[u8], key: &str) -> Result<Decoded, DecodeError> {
    if key.is_empty() {
        return Err(DecodeError::MissingKey);
    }
    let sealed = std::str::from_utf8(bytes)?;
    let text = cipher::decrypt(sealed, key).map_err(|CipherError::EmptyKey| DecodeError::MissingKey)?;
    let value: Value = serde_json::from_str(&text)?;
    let Value::Object(object) = value else {
        return Err(DecodeError::NotObject);
    };
    if !matches!(object.get("action"), Some(Value::String(_))) {
        return Err(DecodeError::MissingAction);
    }
    let message: Message =
        serde_json::from_value(Value::Object(object)).map_err(DecodeError::Schema)?;
    Ok(Decoded { message, text })
}

/// Error decoding a datagram.
///
/// `MissingKey` is a transform failure; `NotUtf8`, `Parse` and `NotObject` mean
/// the text is not a message at all; `MissingAction` and `Schema` mean it is
/// JSON but not a well-formed message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("transform key is empty")]
    MissingKey,
    #[error("datagram is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("malformed JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotObject,
    #[error("message has no string 'action'")]
    MissingAction,
    #[error("message does not match schema: {0}")]
    Schema(serde_json::Error),
}

impl DecodeError {
    pub fn is_transform(&self) -> bool {
        matches!(self, DecodeError::MissingKey)
    }

    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            DecodeError::NotUtf8(_) | DecodeError::Parse(_) | DecodeError::NotObject
        )
    }

    pub fn is_schema(&self) -> bool {
        matches!(self, DecodeError::MissingAction | DecodeError::Schema(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use serde_json::json;

    fn sample() -> Message {
        let Value::Object(data) = json!({
            "chatid": "alice",
            "content": "Hello, world! 100% sure?",
            "nested": { "list": [1, 2, 3] }
        }) else {
            unreachable!()
        };
        Message::request("send_message", Some(data))
    }

    #[test]
    fn roundtrip_message() {
        let msg = sample();
        let bytes = encode(&msg, "LoginKey9").unwrap();
        let decoded = decode(&bytes, "LoginKey9").unwrap();
        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.text, to_text(&msg).unwrap());
    }

    #[test]
    fn roundtrip_reply_with_extra_fields() {
        let mut msg = Message::reply("error", Status::Error, Some("denied".into()), None);
        msg.extra.insert("original_action".into(), json!("login"));
        let bytes = encode(&msg, "k3y").unwrap();
        assert_eq!(decode(&bytes, "k3y").unwrap().message, msg);
    }

    #[test]
    fn wire_bytes_are_transformed() {
        let bytes = encode(&sample(), "LoginKey9").unwrap();
        let raw = String::from_utf8(bytes).unwrap();
        assert!(!raw.contains("send_message"));
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(encode(&sample(), ""), Err(EncodeError::MissingKey)));
        let err = decode(b"{}", "").unwrap_err();
        assert!(err.is_transform());
    }

    #[test]
    fn oversize_rejected_not_truncated() {
        let Value::Object(data) = json!({ "content": "x".repeat(MAX_DATAGRAM_SIZE) }) else {
            unreachable!()
        };
        let msg = Message::request("send_message", Some(data));
        match encode(&msg, "k") {
            Err(EncodeError::TooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_DATAGRAM_SIZE);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_parse_error() {
        let err = decode(b"not json at all", "k").unwrap_err();
        assert!(err.is_parse());
        let err = decode(&[0xff, 0xfe], "k").unwrap_err();
        assert!(err.is_parse());
        let err = decode(b"[1,2]", "k").unwrap_err();
        assert!(matches!(err, DecodeError::NotObject));
    }

    #[test]
    fn missing_action_is_schema_error() {
        let bytes = seal(r#"{"status":"success"}"#, "k").unwrap();
        let err = decode(&bytes, "k").unwrap_err();
        assert!(err.is_schema());
        assert!(matches!(err, DecodeError::MissingAction));

        let bytes = seal(r#"{"action":"ack","status":"maybe"}"#, "k").unwrap();
        assert!(decode(&bytes, "k").unwrap_err().is_schema());
    }

    #[test]
    fn wrong_key_does_not_decode() {
        let bytes = encode(&sample(), "session-key-123").unwrap();
        assert!(decode(&bytes, "LoginKey9").is_err());
    }

    #[test]
    fn decoded_text_is_exact_pre_transform_text() {
        let text = r#"{"action":"receive_message","data":{"transaction_id":"t1","content":"hi"}}"#;
        let bytes = seal(text, "LoginKey9").unwrap();
        let decoded = decode(&bytes, "LoginKey9").unwrap();
        assert_eq!(decoded.text, text);
    }
}
