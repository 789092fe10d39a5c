//! Server configuration.
//!
//! A JSON document with three sections:
//!
//! ```json
//! {
//!   "origin":   { "host": "0.0.0.0", "port": 1080, "keepalive": true },
//!   "gameplay": { "motd": "...", "serversidesave": true, "timesync": false, ... },
//!   "users":    { "banned": [], "opped": [] }
//! }
//! ```
//!
//! Every field has a default, so an empty document (`{}`) is a valid
//! configuration.

use std::path::Path;

use nepenthe_protocol::{ClientVersion, LegacyValue, LEGACY_SERVER_VERSION};
use serde::{Deserialize, Serialize};

use crate::NepentheError;

const DEFAULT_MOTD: &str = "GDTMP-compatible Server";

/// Full server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub origin: OriginConfig,
    pub gameplay: GameplayConfig,
    pub users: UsersConfig,
}

/// Where to listen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub host: String,
    pub port: u16,
    /// Ping every connected peer once a second.
    pub keepalive: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 1080,
            keepalive: true,
        }
    }
}

/// Ruleset forwarded to clients in `SETTINGS` and `POLLRES`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameplayConfig {
    pub motd: String,
    pub description: String,
    pub timesync: bool,
    pub syncconsoles: bool,
    pub offlineconsoles: bool,
    pub reviewbattle: bool,
    /// Save the player record on every company update.
    pub serversidesave: bool,
    pub cheatmodallowed: bool,
}

impl Default for GameplayConfig {
    fn default() -> Self {
        Self {
            motd: DEFAULT_MOTD.into(),
            description: DEFAULT_MOTD.into(),
            timesync: false,
            syncconsoles: false,
            offlineconsoles: false,
            reviewbattle: false,
            serversidesave: true,
            cheatmodallowed: false,
        }
    }
}

impl GameplayConfig {
    fn flags(&self) -> [bool; 6] {
        [
            self.timesync,
            self.syncconsoles,
            self.offlineconsoles,
            self.reviewbattle,
            self.serversidesave,
            self.cheatmodallowed,
        ]
    }

    /// Payload of the `SETTINGS` packet.
    pub fn settings_fields(&self) -> Vec<LegacyValue> {
        std::iter::once(LegacyValue::from(LEGACY_SERVER_VERSION))
            .chain(self.flags().map(LegacyValue::from))
            .collect()
    }

    /// Payload of the `POLLRES` packet for a server with `session_count`
    /// live sessions that admits clients from `min_client_version` on.
    pub fn poll_fields(
        &self,
        session_count: usize,
        min_client_version: &ClientVersion,
    ) -> Vec<LegacyValue> {
        std::iter::once(LegacyValue::from(session_count))
            .chain(self.flags().map(LegacyValue::from))
            .chain([
                LegacyValue::from(min_client_version.to_string()),
                LegacyValue::from(&self.description),
                LegacyValue::from(LEGACY_SERVER_VERSION),
            ])
            .collect()
    }
}

/// Access-control lists. The core only carries them; extensions enforce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    /// Banned authentication codes or addresses.
    pub banned: Vec<String>,
    /// Operator authentication codes.
    pub opped: Vec<String>,
}

impl ServerConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    /// [`NepentheError::Config`] if the document isn't valid JSON or a
    /// field has the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self, NepentheError> {
        serde_json::from_str(json).map_err(|e| NepentheError::Config(e.to_string()))
    }

    /// Reads and parses a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, NepentheError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| NepentheError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.origin.host, self.origin.port)
    }
}
