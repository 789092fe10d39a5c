//! The status document served on plain HTTP requests.

use serde::{Deserialize, Serialize};

use crate::version::agent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub agent: String,
    pub status: String,
    pub motd: String,
    pub description: String,
}

impl StatusDocument {
    /// Status of a running server with the given message of the day.
    pub fn running(motd: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent: agent(),
            status: "running".into(),
            motd: motd.into(),
            description: description.into(),
        }
    }
}
