//! Error types for the protocol layer.
//!
//! Every failure here is a *protocol error*: the peer sent something the
//! codec can't make sense of, or the caller asked for an encoding the wire
//! format can't express. The session layer recovers from these locally
//! (usually by kicking the offending peer); none of them are fatal to the
//! server.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serializing a structured envelope to JSON failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Parsing a structured envelope or record document failed.
    ///
    /// Common causes: malformed JSON, wrong data types, or a payload that
    /// was truncated in transit.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// Deflating or inflating a binary payload failed.
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    /// A nested legacy value goes deeper than there are separators.
    #[error("legacy value nested {0} levels deep, at most 3 are supported")]
    NestingTooDeep(usize),

    /// A positional field could not be coerced to its declared type.
    #[error("field `{field}` has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// A packet carried fewer fields than its layout requires.
    #[error("expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    /// The message is invalid at the protocol level (empty frame, missing
    /// packet id, bad flags).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
