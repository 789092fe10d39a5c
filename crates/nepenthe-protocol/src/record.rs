//! The persisted player record and its two codecs.
//!
//! - **Structured**: a field-name → value JSON document, used for
//!   persistence and the binary protocol. Missing keys fall back to the
//!   defaults, so older documents still load.
//! - **Positional**: 14 text tokens in [`POSITIONAL_FIELDS`] order, the
//!   body of a legacy `COMPANY` packet. The order is part of the wire
//!   protocol: changing it breaks every legacy client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Positional field names, in wire order.
pub const POSITIONAL_FIELDS: [&str; 14] = [
    "name",
    "boss",
    "cash",
    "fans",
    "researchPoints",
    "week",
    "employees",
    "platformCount",
    "gameCount",
    "favouriteGenre",
    "avgCosts",
    "avgIncome",
    "avgScore",
    "highScore",
];

/// A player's persisted game statistics.
///
/// Numeric fields default to `-1` ("unset"), text to the empty string,
/// booleans to `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerRecord {
    /// Company name.
    pub name: String,
    pub boss: String,
    pub cash: i64,
    pub fans: i64,
    pub research_points: i64,
    /// In-game week; fractional while a week is in progress.
    pub current_week: f64,
    pub employees: i64,
    pub platform_count: i64,
    pub game_count: i64,
    pub favourite_genre: String,
    pub avg_costs: f64,
    pub avg_income: f64,
    pub avg_score: f64,
    pub high_score: f64,
    /// Operator flag. Persisted, never carried in the positional form.
    pub op: bool,
}

impl Default for PlayerRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            boss: String::new(),
            cash: -1,
            fans: -1,
            research_points: -1,
            current_week: -1.0,
            employees: -1,
            platform_count: -1,
            game_count: -1,
            favourite_genre: String::new(),
            avg_costs: -1.0,
            avg_income: -1.0,
            avg_score: -1.0,
            high_score: -1.0,
            op: false,
        }
    }
}

impl PlayerRecord {
    /// Encodes the record as a structured document.
    pub fn to_document(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(ProtocolError::Encode)
    }

    /// Decodes a structured document; absent keys keep their defaults.
    pub fn from_document(document: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(document).map_err(ProtocolError::Decode)
    }

    /// Replaces the record from a structured document sent by the peer.
    /// `op` is server-owned and keeps its current value. On error the
    /// record is unchanged.
    pub fn apply_document(&mut self, document: Value) -> Result<(), ProtocolError> {
        let updated = Self {
            op: self.op,
            ..Self::from_document(document)?
        };
        *self = updated;
        Ok(())
    }

    /// Encodes the record as positional tokens. No join marker is added.
    pub fn to_positional(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.boss.clone(),
            self.cash.to_string(),
            self.fans.to_string(),
            self.research_points.to_string(),
            self.current_week.to_string(),
            self.employees.to_string(),
            self.platform_count.to_string(),
            self.game_count.to_string(),
            self.favourite_genre.clone(),
            self.avg_costs.to_string(),
            self.avg_income.to_string(),
            self.avg_score.to_string(),
            self.high_score.to_string(),
        ]
    }

    /// Decodes a fresh record from positional tokens. Tokens past the 14th
    /// are ignored.
    pub fn from_positional<S: AsRef<str>>(tokens: &[S]) -> Result<Self, ProtocolError> {
        let mut record = Self::default();
        record.apply_positional(tokens)?;
        Ok(record)
    }

    /// Overwrites every positional field from `tokens`, leaving fields that
    /// have no positional slot (`op`) untouched. On error the record is
    /// unchanged.
    pub fn apply_positional<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<(), ProtocolError> {
        if tokens.len() < POSITIONAL_FIELDS.len() {
            return Err(ProtocolError::MissingFields {
                expected: POSITIONAL_FIELDS.len(),
                got: tokens.len(),
            });
        }
        let t = |i: usize| tokens[i].as_ref();

        let updated = Self {
            name: t(0).to_owned(),
            boss: t(1).to_owned(),
            cash: integer(2, t(2))?,
            fans: integer(3, t(3))?,
            research_points: integer(4, t(4))?,
            current_week: real(5, t(5))?,
            employees: integer(6, t(6))?,
            platform_count: integer(7, t(7))?,
            game_count: integer(8, t(8))?,
            favourite_genre: t(9).to_owned(),
            avg_costs: real(10, t(10))?,
            avg_income: real(11, t(11))?,
            avg_score: real(12, t(12))?,
            high_score: real(13, t(13))?,
            op: self.op,
        };
        *self = updated;
        Ok(())
    }
}

fn invalid(index: usize, token: &str) -> ProtocolError {
    ProtocolError::InvalidField {
        field: POSITIONAL_FIELDS[index],
        value: token.to_owned(),
    }
}

/// Integer coercion. Integral reals such as `"12.0"` are accepted since
/// legacy clients print every number the same way.
fn integer(index: usize, token: &str) -> Result<i64, ProtocolError> {
    let token = token.trim();
    if let Ok(value) = token.parse::<i64>() {
        return Ok(value);
    }
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => Ok(value as i64),
        _ => Err(invalid(index, token)),
    }
}

fn real(index: usize, token: &str) -> Result<f64, ProtocolError> {
    let token = token.trim();
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(invalid(index, token)),
    }
}
