//! Wire protocol for Nepenthe.
//!
//! Two wire formats share one message-oriented transport:
//!
//! - **Legacy** ([`legacy`]): separator-delimited text frames spoken by
//!   older clients.
//! - **Binary** ([`binary`]): a flags byte followed by an optionally
//!   deflated JSON envelope, used once a session has upgraded.
//!
//! [`encode_frame`]/[`decode_frame`] pick between them; [`Packet`] is the
//! format-independent result. [`PlayerRecord`] is the persisted player
//! state with its structured and positional codecs.
//!
//! # Architecture
//!
//! ```text
//! Transport (Frame) → Protocol (Packet) → Session (lifecycle, player state)
//! ```
//!
//! Nothing here knows about connections or sessions; every function is a
//! pure transformation.

pub mod binary;
mod codec;
mod error;
pub mod legacy;
mod packet;
mod record;
mod status;
mod version;

pub use codec::{decode_frame, encode_frame, SendOptions, WireMode};
pub use error::ProtocolError;
pub use legacy::LegacyValue;
pub use packet::{ids, Packet, PacketData};
pub use record::{PlayerRecord, POSITIONAL_FIELDS};
pub use status::StatusDocument;
pub use version::{
    agent, ClientVersion, LEGACY_SERVER_ID, LEGACY_SERVER_VERSION, MIN_CLIENT_VERSION,
    PROTOCOL_VERSION,
};
