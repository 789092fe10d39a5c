//! The legacy separator-delimited text format.
//!
//! A legacy message is one text frame:
//!
//! ```text
//! ID ú arg1 ú arg2 ú … ú SENDER
//! ```
//!
//! where `ú` (U+00FA) is the top-level separator. Arguments may be nested
//! lists; each nesting depth has its own separator, looked up in the fixed
//! [`SEPARATORS`] table. Decoding splits by the separator of the current
//! depth and, when that yields more than one piece, recurses into every
//! piece at `depth + 1`. Encoding is the structural inverse.
//!
//! Both directions use the same table and pass the depth down explicitly,
//! so siblings at the same depth always see the same separator.
//!
//! A separator inside a leaf is written as the literal text `\xNN` and
//! turned back into the character on decode. Legacy clients don't unescape,
//! so they display such text with the escape visible.

use serde::Serialize;
use serde_json::Value;

use crate::ProtocolError;

/// Separator for each nesting depth, outermost first.
///
/// Depth 1 (list entries) and depth 2 (entry members) follow what legacy
/// clients emit for their mod list: entries joined by `ü`, id/name pairs
/// joined by `û`.
pub const SEPARATORS: [char; 4] = ['\u{FA}', '\u{FC}', '\u{FB}', '\u{FD}'];

/// The top-level field separator.
pub const FIELD_SEPARATOR: char = SEPARATORS[0];

/// A decoded legacy argument: either a scalar leaf or a nested list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LegacyValue {
    Text(String),
    List(Vec<LegacyValue>),
}

impl LegacyValue {
    /// Returns the scalar text, or `None` for a list.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::List(_) => None,
        }
    }

    /// Returns the list items, or `None` for a scalar.
    pub fn as_list(&self) -> Option<&[LegacyValue]> {
        match self {
            Self::Text(_) => None,
            Self::List(items) => Some(items),
        }
    }

    /// Rebuilds the raw text this value was decoded from at `depth`,
    /// joining nested pieces with their separators again.
    ///
    /// Free-text fields (names, messages) use this: a name containing a
    /// nested separator character such as `ü` decodes as a list, but still
    /// means the original string.
    pub fn to_raw_text(&self, depth: usize) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::List(items) => {
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        if let Some(&separator) = SEPARATORS.get(depth) {
                            out.push(separator);
                        }
                    }
                    out.push_str(&item.to_raw_text(depth + 1));
                }
                out
            }
        }
    }

    /// Converts a JSON value carried in a binary envelope into a legacy
    /// value. Scalars are stringified the way legacy clients print them;
    /// `null` becomes the empty string and objects their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Text(String::new()),
            Value::String(s) => Self::Text(s.clone()),
            Value::Bool(b) => Self::Text(b.to_string()),
            Value::Number(n) => Self::Text(n.to_string()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(_) => Self::Text(value.to_string()),
        }
    }
}

impl From<String> for LegacyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for LegacyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<&String> for LegacyValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<bool> for LegacyValue {
    fn from(value: bool) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u32> for LegacyValue {
    fn from(value: u32) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for LegacyValue {
    fn from(value: u64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for LegacyValue {
    fn from(value: i64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<usize> for LegacyValue {
    fn from(value: usize) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<LegacyValue>> for LegacyValue {
    fn from(value: Vec<LegacyValue>) -> Self {
        Self::List(value)
    }
}

/// Decodes `text` found at nesting `depth`.
///
/// Past the last separator everything is a leaf.
pub fn decode_value(text: &str, depth: usize) -> LegacyValue {
    let Some(&separator) = SEPARATORS.get(depth) else {
        return LegacyValue::Text(unescape(text));
    };
    let pieces: Vec<&str> = text.split(separator).collect();
    if pieces.len() > 1 {
        LegacyValue::List(
            pieces
                .into_iter()
                .map(|piece| decode_value(piece, depth + 1))
                .collect(),
        )
    } else {
        LegacyValue::Text(unescape(text))
    }
}

/// Encodes `value` as it appears at nesting `depth`, appending to `out`.
///
/// # Errors
/// [`ProtocolError::NestingTooDeep`] if a list would need a separator past
/// the end of [`SEPARATORS`].
pub fn encode_value(value: &LegacyValue, depth: usize, out: &mut String) -> Result<(), ProtocolError> {
    match value {
        LegacyValue::Text(text) => {
            escape_into(text, out);
            Ok(())
        }
        LegacyValue::List(items) => {
            let separator = *SEPARATORS
                .get(depth)
                .ok_or(ProtocolError::NestingTooDeep(depth))?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(separator);
                }
                encode_value(item, depth + 1, out)?;
            }
            Ok(())
        }
    }
}

/// Splits a legacy message into its packet id and arguments.
///
/// The trailing sender field is left in the argument list.
///
/// # Errors
/// [`ProtocolError::InvalidMessage`] if the packet id is empty.
pub fn decode_message(text: &str) -> Result<(String, Vec<LegacyValue>), ProtocolError> {
    let mut pieces = text.split(FIELD_SEPARATOR);
    let id = pieces.next().unwrap_or_default();
    if id.is_empty() {
        return Err(ProtocolError::InvalidMessage("missing packet id".into()));
    }
    let args = pieces.map(|piece| decode_value(piece, 1)).collect();
    Ok((id.to_owned(), args))
}

/// Builds a legacy message: `id`, every argument, then `sender`, joined by
/// the top-level separator.
pub fn encode_message(id: &str, args: &[LegacyValue], sender: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(id.len() + sender.len() + 16 * args.len());
    escape_into(id, &mut out);
    for arg in args {
        out.push(FIELD_SEPARATOR);
        encode_value(arg, 1, &mut out)?;
    }
    out.push(FIELD_SEPARATOR);
    escape_into(sender, &mut out);
    Ok(out)
}

/// Copies a leaf into `out`, spelling any separator as the literal text
/// `\xNN` so it can't split the message.
fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        if SEPARATORS.contains(&c) {
            out.push_str(&format!("\\x{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
}

/// Reverses [`escape_into`]. Only escapes that spell a separator are
/// replaced; any other `\x` text is kept as is.
fn unescape(text: &str) -> String {
    if !text.contains("\\x") {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 2..];
        let separator = tail
            .get(..2)
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32)
            .filter(|c| SEPARATORS.contains(c));
        match separator {
            Some(c) => {
                out.push(c);
                rest = &tail[2..];
            }
            None => {
                out.push_str("\\x");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> LegacyValue {
        LegacyValue::Text(s.into())
    }

    #[test]
    fn test_decode_message_splits_id_and_args() {
        let (id, args) = decode_message("REQID\u{FA}42\u{FA}1.5.5.0\u{FA}\u{FA}7").unwrap();
        assert_eq!(id, "REQID");
        assert_eq!(args, vec![text("42"), text("1.5.5.0"), text(""), text("7")]);
    }

    #[test]
    fn test_decode_message_without_args() {
        let (id, args) = decode_message("POLL").unwrap();
        assert_eq!(id, "POLL");
        assert!(args.is_empty());
    }

    #[test]
    fn test_decode_message_empty_id_is_error() {
        assert!(matches!(decode_message(""), Err(ProtocolError::InvalidMessage(_))));
        assert!(decode_message("\u{FA}x").is_err());
    }

    #[test]
    fn test_decode_nested_mod_list() {
        // Two mods: entries split by ü, id/name split by û.
        let raw = "a\u{FB}Alpha\u{FC}b\u{FB}Beta";
        let value = decode_value(raw, 1);
        assert_eq!(
            value,
            LegacyValue::List(vec![
                LegacyValue::List(vec![text("a"), text("Alpha")]),
                LegacyValue::List(vec![text("b"), text("Beta")]),
            ])
        );
    }

    #[test]
    fn test_decode_siblings_use_same_separator() {
        // Every entry at depth 2 is split by the same separator, whatever
        // its position among its siblings.
        let raw = "x\u{FD}y\u{FB}z\u{FC}p\u{FB}q\u{FC}r";
        let value = decode_value(raw, 1);
        let LegacyValue::List(entries) = value else { panic!("expected list") };
        assert_eq!(
            entries[0],
            LegacyValue::List(vec![
                LegacyValue::List(vec![text("x"), text("y")]),
                text("z"),
            ])
        );
        assert_eq!(entries[1], LegacyValue::List(vec![text("p"), text("q")]));
        // A single piece stays a leaf.
        assert_eq!(entries[2], text("r"));
    }

    #[test]
    fn test_decode_past_last_separator_is_leaf() {
        assert_eq!(decode_value("a\u{FC}b", 4), text("a\u{FC}b"));
    }

    #[test]
    fn test_encode_message_appends_sender() {
        let encoded = encode_message("XNM", &[text("1")], "133333337").unwrap();
        assert_eq!(encoded, "XNM\u{FA}1\u{FA}133333337");
    }

    #[test]
    fn test_encode_nested_is_inverse_of_decode() {
        let args = vec![
            text("42"),
            LegacyValue::List(vec![
                LegacyValue::List(vec![text("a"), text("Alpha")]),
                LegacyValue::List(vec![text("b"), text("Beta")]),
            ]),
        ];
        let encoded = encode_message("MODLIST", &args, "1").unwrap();
        let (id, decoded) = decode_message(&encoded).unwrap();
        assert_eq!(id, "MODLIST");
        assert_eq!(&decoded[..2], &args[..]);
        assert_eq!(decoded[2], text("1"));
    }

    #[test]
    fn test_encode_escapes_separators_in_leaves() {
        let encoded = encode_message("MSG", &[text("hi\u{FA}there")], "1").unwrap();
        assert_eq!(encoded, "MSG\u{FA}hi\\xFAthere\u{FA}1");
    }

    #[test]
    fn test_escaped_separators_in_leaves_decode_back() {
        let args = vec![text("M\u{FC}ller"), text("a\u{FA}b\u{FB}c\u{FD}")];
        let encoded = encode_message("COMPANY", &args, "1").unwrap();
        let (_, decoded) = decode_message(&encoded).unwrap();
        assert_eq!(&decoded[..2], &args[..]);
    }

    #[test]
    fn test_unescape_keeps_other_backslash_x_text() {
        assert_eq!(decode_value("C:\\xyz", 1), text("C:\\xyz"));
        assert_eq!(decode_value("\\x41\\x", 1), text("\\x41\\x"));
        assert_eq!(decode_value("\\xfc", 1), text("\u{FC}"));
    }

    #[test]
    fn test_raw_text_rejoins_nested_pieces() {
        // A legacy client sends names unescaped.
        let raw = "M\u{FC}ller \u{FB}Games\u{FC}";
        let value = decode_value(raw, 1);
        assert!(value.as_list().is_some());
        assert_eq!(value.to_raw_text(1), raw);
        assert_eq!(text("plain").to_raw_text(1), "plain");
    }

    #[test]
    fn test_encode_too_deep_is_error() {
        let deep = LegacyValue::List(vec![LegacyValue::List(vec![LegacyValue::List(vec![
            LegacyValue::List(vec![text("a"), text("b")]),
        ])])]);
        let err = encode_message("X", &[deep], "1").unwrap_err();
        assert!(matches!(err, ProtocolError::NestingTooDeep(4)));
    }

    #[test]
    fn test_from_json_stringifies_scalars() {
        let value = serde_json::json!(["a", 1, true, null, [2.5]]);
        assert_eq!(
            LegacyValue::from_json(&value),
            LegacyValue::List(vec![
                text("a"),
                text("1"),
                text("true"),
                text(""),
                LegacyValue::List(vec![text("2.5")]),
            ])
        );
    }
}
