//! Session credentials and transform-key selection.

use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Key for traffic before a session exists. Its length (9) is the shift.
pub const PRE_SESSION_KEY: &str = "LoginKey9";

/// Default action name whose successful acknowledgment establishes a session.
pub const DEFAULT_SESSION_ACTION: &str = "login";

pub const KEY_SESSION_KEY: &str = "session_key";
pub const KEY_CHAT_ID: &str = "chatid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_key: String,
    pub chat_id: String,
}

impl Credentials {
    /// Read `session_key` and `chatid` from an acknowledgment's data.
    pub fn from_ack_data(data: &Map<String, Value>) -> Option<Self> {
        let session_key = data.get(KEY_SESSION_KEY)?.as_str()?;
        let chat_id = data.get(KEY_CHAT_ID)?.as_str()?;
        if session_key.is_empty() {
            return None;
        }
        Some(Self {
            session_key: session_key.to_owned(),
            chat_id: chat_id.to_owned(),
        })
    }
}

/// Session state shared by the submission path and the receive loop.
/// Credentials are set once, when the session-establishment acknowledgment succeeds.
pub struct Session {
    establishing_action: String,
    credentials: RwLock<Option<Credentials>>,
}

impl Session {
    pub fn new(establishing_action: impl Into<String>) -> Self {
        Self {
            establishing_action: establishing_action.into(),
            credentials: RwLock::new(None),
        }
    }

    pub fn establishing_action(&self) -> &str {
        &self.establishing_action
    }

    pub fn is_establishing(&self, kind_label: &str) -> bool {
        kind_label == self.establishing_action
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    pub fn is_established(&self) -> bool {
        self.credentials.read().is_some()
    }

    /// Session key if established, otherwise the pre-session key.
    pub fn active_key(&self) -> String {
        self.credentials
            .read()
            .as_ref()
            .map(|c| c.session_key.clone())
            .unwrap_or_else(|| PRE_SESSION_KEY.to_owned())
    }

    /// Key for an outbound request. Session establishment always goes out under the pre-session key.
    pub fn key_for(&self, kind_label: &str) -> String {
        if self.is_establishing(kind_label) {
            PRE_SESSION_KEY.to_owned()
        } else {
            self.active_key()
        }
    }

    /// Keys to try, in order, when decoding an incoming datagram. A late reply to a
    /// pre-session request can still arrive under the pre-session key.
    pub fn decode_keys(&self) -> Vec<String> {
        match self.credentials.read().as_ref() {
            Some(c) if c.session_key != PRE_SESSION_KEY => {
                vec![c.session_key.clone(), PRE_SESSION_KEY.to_owned()]
            }
            _ => vec![PRE_SESSION_KEY.to_owned()],
        }
    }

    /// Adopt credentials. Returns false (and keeps the existing ones) if a session is already established.
    pub fn establish(&self, credentials: Credentials) -> bool {
        let mut slot = self.credentials.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(credentials);
        true
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_ACTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds(key: &str) -> Credentials {
        Credentials {
            session_key: key.into(),
            chat_id: "alice".into(),
        }
    }

    #[test]
    fn pre_session_keys() {
        let s = Session::default();
        assert!(!s.is_established());
        assert_eq!(s.active_key(), PRE_SESSION_KEY);
        assert_eq!(s.key_for("get_rooms"), PRE_SESSION_KEY);
        assert_eq!(s.decode_keys(), vec![PRE_SESSION_KEY.to_owned()]);
    }

    #[test]
    fn established_session_prefers_session_key() {
        let s = Session::default();
        assert!(s.establish(creds("s3ss10n")));
        assert_eq!(s.active_key(), "s3ss10n");
        assert_eq!(s.key_for("get_rooms"), "s3ss10n");
        assert_eq!(s.key_for("login"), PRE_SESSION_KEY);
        assert_eq!(
            s.decode_keys(),
            vec!["s3ss10n".to_owned(), PRE_SESSION_KEY.to_owned()]
        );
    }

    #[test]
    fn establish_only_once() {
        let s = Session::default();
        assert!(s.establish(creds("first")));
        assert!(!s.establish(creds("second")));
        assert_eq!(s.credentials().unwrap().session_key, "first");
    }

    #[test]
    fn credentials_from_ack_data() {
        let serde_json::Value::Object(data) =
            json!({ "transaction_id": "t", "session_key": "abc", "chatid": "bob" })
        else {
            unreachable!()
        };
        let c = Credentials::from_ack_data(&data).unwrap();
        assert_eq!(c.session_key, "abc");
        assert_eq!(c.chat_id, "bob");

        let serde_json::Value::Object(partial) = json!({ "session_key": "abc" }) else {
            unreachable!()
        };
        assert!(Credentials::from_ack_data(&partial).is_none());
    }

    #[test]
    fn custom_establishing_action() {
        let s = Session::new("authenticate");
        assert!(s.is_establishing("authenticate"));
        assert!(!s.is_establishing("login"));
    }
}
