//! Logical packets: what a frame means once the wire format is peeled off.

use std::borrow::Cow;

use serde_json::Value;

use crate::LegacyValue;

/// Packet identifiers understood by the core.
pub mod ids {
    /// Client → server: code, client version, declared mods.
    pub const REQID: &str = "REQID";
    /// Server → client: code, assigned session id.
    pub const YOURID: &str = "YOURID";
    /// Client → server: 14 positional record fields, optional join marker.
    pub const COMPANY: &str = "COMPANY";
    pub const MSG: &str = "MSG";
    pub const PRIVMSG: &str = "PRIVMSG";
    /// Server → client: human-readable reason.
    pub const KICK: &str = "KICK";
    /// Client → server liveness probe.
    pub const POLL: &str = "POLL";
    pub const POLLRES: &str = "POLLRES";
    /// Server gameplay settings, sent after identification.
    pub const SETTINGS: &str = "SETTINGS";
    /// Protocol-version advertisement (server) / upgrade acknowledgement (client).
    pub const XNM: &str = "XNM";
    /// Carrier for a structured envelope inside a legacy text packet.
    pub const XDAT: &str = "XDAT";
    pub const SAVEDATA: &str = "SAVEDATA";
    pub const SAVEFAIL: &str = "SAVEFAIL";

    /// Trailing `COMPANY` token that signals the player has joined.
    pub const JOIN_MARKER: &str = "join";
}

/// Payload of a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    /// Positional legacy arguments.
    Fields(Vec<LegacyValue>),
    /// An arbitrary structured document.
    Document(Value),
}

/// A decoded packet, independent of how it was framed.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: String,
    pub data: PacketData,
    /// Sender identifier, when the frame carried one out of band.
    pub source: Option<String>,
}

impl Packet {
    /// Builds a packet of positional legacy arguments.
    pub fn legacy<I, V>(id: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<LegacyValue>,
    {
        Self {
            id: id.into(),
            data: PacketData::Fields(fields.into_iter().map(Into::into).collect()),
            source: None,
        }
    }

    /// Builds a packet carrying a structured document.
    pub fn document(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: PacketData::Document(data),
            source: None,
        }
    }

    /// Returns `true` if the packet has the given id.
    pub fn is(&self, id: &str) -> bool {
        self.id == id
    }

    /// Positional view of the payload.
    ///
    /// A document that is an array is read element by element; any other
    /// document has no positional fields.
    pub fn fields(&self) -> Cow<'_, [LegacyValue]> {
        match &self.data {
            PacketData::Fields(fields) => Cow::Borrowed(fields),
            PacketData::Document(Value::Array(items)) => {
                Cow::Owned(items.iter().map(LegacyValue::from_json).collect())
            }
            PacketData::Document(_) => Cow::Owned(Vec::new()),
        }
    }

    /// Scalar text of field `index`, if present and not a list.
    pub fn text(&self, index: usize) -> Option<String> {
        self.fields()
            .get(index)
            .and_then(LegacyValue::as_text)
            .map(str::to_owned)
    }

    /// JSON view of the payload.
    pub fn to_json(&self) -> Value {
        match &self.data {
            PacketData::Fields(fields) => serde_json::to_value(fields).unwrap_or(Value::Null),
            PacketData::Document(value) => value.clone(),
        }
    }
}
