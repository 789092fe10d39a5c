//! Frame-level codec: chooses between the legacy text format and the binary
//! envelope for outbound packets, and turns inbound frames back into
//! [`Packet`]s.
//!
//! The choice is driven by the session's [`WireMode`] plus per-call
//! [`SendOptions`]:
//!
//! ```text
//! Legacy   + default       → text frame   (documents ride in an XDAT carrier)
//! Legacy   + force_binary  → binary frame
//! Upgraded + any           → binary frame (0x02 set if legacy_compatible)
//! ```

use nepenthe_transport::Frame;
use serde_json::Value;

use crate::binary::{self, BinaryFlags, Envelope};
use crate::legacy::{self, LegacyValue};
use crate::packet::{ids, Packet, PacketData};
use crate::{ProtocolError, LEGACY_SERVER_ID};

/// Which wire format a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// Separator-delimited text frames. Every session starts here.
    #[default]
    Legacy,
    /// Binary envelope frames, after the peer acknowledged `XNM`.
    Upgraded,
}

impl std::fmt::Display for WireMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Upgraded => write!(f, "upgraded"),
        }
    }
}

/// Per-send framing overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Use binary framing even for a legacy session.
    pub force_binary: bool,
    /// Mark the binary frame as carrying a legacy-style packet.
    pub legacy_compatible: bool,
}

impl SendOptions {
    /// Binary framing flagged as legacy-compatible, for legacy-only control
    /// packets that must still reach an upgraded peer.
    pub fn legacy_compatible() -> Self {
        Self {
            force_binary: false,
            legacy_compatible: true,
        }
    }
}

/// Encodes `packet` for a session currently in `mode`.
pub fn encode_frame(packet: &Packet, mode: WireMode, options: SendOptions) -> Result<Frame, ProtocolError> {
    let source = packet.source.as_deref().unwrap_or(LEGACY_SERVER_ID);

    if mode == WireMode::Legacy && !options.force_binary {
        let text = match &packet.data {
            PacketData::Fields(fields) => legacy::encode_message(&packet.id, fields, source)?,
            PacketData::Document(data) => {
                let carried = Envelope {
                    id: packet.id.clone(),
                    data: data.clone(),
                    source: Value::Null,
                };
                let json = serde_json::to_string(&carried).map_err(ProtocolError::Encode)?;
                legacy::encode_message(ids::XDAT, &[LegacyValue::Text(json)], source)?
            }
        };
        return Ok(Frame::Text(text));
    }

    let envelope = Envelope {
        id: packet.id.clone(),
        data: packet.to_json(),
        source: Value::String(source.to_owned()),
    };
    let flags = BinaryFlags {
        compressed: true,
        legacy: options.legacy_compatible,
    };
    Ok(Frame::Binary(binary::encode_binary(&envelope, flags)?))
}

/// Decodes an inbound frame into a packet.
///
/// Text frames are legacy messages; an `XDAT` message whose first argument
/// is a JSON envelope is unwrapped into the packet it carries. Binary
/// frames flagged legacy-style must carry an argument array.
pub fn decode_frame(frame: &Frame) -> Result<Packet, ProtocolError> {
    match frame {
        Frame::Text(text) => {
            let (id, fields) = legacy::decode_message(text)?;
            if id == ids::XDAT {
                if let Some(carried) = fields
                    .first()
                    .map(|json| json.to_raw_text(1))
                    .and_then(|json| serde_json::from_str::<Envelope>(&json).ok())
                {
                    return Ok(from_envelope(carried, false));
                }
            }
            let source = fields.last().and_then(LegacyValue::as_text).map(str::to_owned);
            Ok(Packet {
                id,
                data: PacketData::Fields(fields),
                source,
            })
        }
        Frame::Binary(bytes) => {
            let (flags, envelope) = binary::decode_binary(bytes)?;
            if flags.legacy && !envelope.data.is_array() {
                return Err(ProtocolError::InvalidMessage(
                    "legacy-style binary payload must be an array".into(),
                ));
            }
            Ok(from_envelope(envelope, flags.legacy))
        }
    }
}

fn from_envelope(envelope: Envelope, legacy_style: bool) -> Packet {
    let source = match envelope.source {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    let data = match envelope.data {
        Value::Array(items) if legacy_style => {
            PacketData::Fields(items.iter().map(LegacyValue::from_json).collect())
        }
        data => PacketData::Document(data),
    };
    Packet {
        id: envelope.id,
        data,
        source,
    }
}
