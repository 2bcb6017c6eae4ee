//! Tally handshake protocol reference implementation.
//! Host-driven: no I/O; host passes decoded datagrams and receives actions.

pub mod cipher;
pub mod digest;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod wire;

pub use digest::{equal_fingerprints, fingerprint, Fingerprint};
pub use handshake::{Action, Coordinator, Delivery};
pub use protocol::{Message, SchemaError, Status};
pub use registry::{CorrelationKey, Outcome, Pending, Registry, RegistryError};
pub use session::{Credentials, Session, PRE_SESSION_KEY};
pub use wire::{decode, encode, DecodeError, Decoded, EncodeError, MAX_DATAGRAM_SIZE};
