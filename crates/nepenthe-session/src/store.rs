//! Persistence port for player records.
//!
//! Nepenthe doesn't decide where player records live. It defines the
//! [`PlayerStore`] trait, keyed by [`AuthCode`], and calls it when a
//! session identifies (load) and when its record changes or it leaves
//! (save). [`MemoryStore`] is the built-in implementation.

use std::collections::HashMap;
use std::future::Future;

use nepenthe_protocol::PlayerRecord;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{AuthCode, PersistenceError};

/// Loads and saves player records by authentication code.
///
/// # Trait bounds
///
/// `Send + Sync + 'static` because one store is shared by every connection
/// task for the life of the server.
///
/// # Example
///
/// ```rust
/// use nepenthe_protocol::PlayerRecord;
/// use nepenthe_session::{AuthCode, PersistenceError, PlayerStore};
///
/// /// Forgets everything. Every player starts fresh.
/// struct NullStore;
///
/// impl PlayerStore for NullStore {
///     async fn load(&self, _code: AuthCode) -> Result<Option<PlayerRecord>, PersistenceError> {
///         Ok(None)
///     }
///
///     async fn save(&self, _code: AuthCode, _record: &PlayerRecord) -> Result<(), PersistenceError> {
///         Ok(())
///     }
/// }
/// ```
pub trait PlayerStore: Send + Sync + 'static {
    /// Fetches the record stored for `code`.
    ///
    /// # Returns
    /// - `Ok(Some(record))` for a known code
    /// - `Ok(None)` for an unknown code
    /// - `Err(_)` if the store failed or the stored data is corrupt
    fn load(
        &self,
        code: AuthCode,
    ) -> impl Future<Output = Result<Option<PlayerRecord>, PersistenceError>> + Send;

    /// Stores `record` under `code`, replacing what was there.
    fn save(
        &self,
        code: AuthCode,
        record: &PlayerRecord,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// In-memory store holding each record as its structured document.
///
/// Records survive reconnects but not restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<AuthCode, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raw stored document for `code`.
    pub async fn document(&self, code: AuthCode) -> Option<Value> {
        self.records.read().await.get(&code).cloned()
    }

    /// Stores a raw document, bypassing record validation.
    pub async fn insert_document(&self, code: AuthCode, document: Value) {
        self.records.write().await.insert(code, document);
    }
}

impl PlayerStore for MemoryStore {
    async fn load(&self, code: AuthCode) -> Result<Option<PlayerRecord>, PersistenceError> {
        let document = self.records.read().await.get(&code).cloned();
        document
            .map(PlayerRecord::from_document)
            .transpose()
            .map_err(PersistenceError::from)
    }

    async fn save(&self, code: AuthCode, record: &PlayerRecord) -> Result<(), PersistenceError> {
        let document = record.to_document()?;
        self.records.write().await.insert(code, document);
        Ok(())
    }
}
