//! The binary envelope format used once a session has upgraded.
//!
//! ```text
//! byte 0      flags   (0x01 = compressed, 0x02 = legacy-style payload)
//! bytes 1..   JSON envelope { id, data, source }, zlib-deflated if 0x01
//! ```

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;
use crate::packet::ids;

/// Flag bit: bytes after the flags byte are a zlib stream.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Flag bit: `data` is a legacy argument array riding the binary transport.
pub const FLAG_LEGACY: u8 = 0b0000_0010;

/// Upper bound on an inflated payload, matching the largest message the
/// transport accepts.
pub const MAX_INFLATED_SIZE: u64 = 8 * 1024 * 1024;

/// The flags byte of a binary frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryFlags {
    pub compressed: bool,
    pub legacy: bool,
}

impl BinaryFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            compressed: byte & FLAG_COMPRESSED != 0,
            legacy: byte & FLAG_LEGACY != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.compressed {
            byte |= FLAG_COMPRESSED;
        }
        if self.legacy {
            byte |= FLAG_LEGACY;
        }
        byte
    }
}

/// The structured document inside a binary frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Packet id. Peers that omit it are sending a bare data carrier.
    #[serde(default = "default_envelope_id")]
    pub id: String,

    #[serde(default)]
    pub data: Value,

    /// Sender identifier; a string or a number depending on the peer.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub source: Value,
}

fn default_envelope_id() -> String {
    ids::XDAT.to_owned()
}

/// Serializes `envelope` behind a flags byte, deflating when asked to.
pub fn encode_binary(envelope: &Envelope, flags: BinaryFlags) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;

    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(flags.to_byte());
    if flags.compressed {
        let mut encoder = ZlibEncoder::new(out, Compression::default());
        encoder.write_all(&json).map_err(ProtocolError::Compression)?;
        out = encoder.finish().map_err(ProtocolError::Compression)?;
    } else {
        out.extend_from_slice(&json);
    }
    Ok(out)
}

/// Strips the flags byte, inflates if needed, and parses the envelope.
pub fn decode_binary(bytes: &[u8]) -> Result<(BinaryFlags, Envelope), ProtocolError> {
    let (&flags_byte, payload) = bytes
        .split_first()
        .ok_or_else(|| ProtocolError::InvalidMessage("empty binary frame".into()))?;
    let flags = BinaryFlags::from_byte(flags_byte);

    let envelope = if flags.compressed {
        let mut json = Vec::new();
        ZlibDecoder::new(payload)
            .take(MAX_INFLATED_SIZE)
            .read_to_end(&mut json)
            .map_err(ProtocolError::Compression)?;
        serde_json::from_slice(&json)
    } else {
        serde_json::from_slice(payload)
    }
    .map_err(ProtocolError::Decode)?;

    Ok((flags, envelope))
}
