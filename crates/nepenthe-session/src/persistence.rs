//! Ordered access to a [`PlayerStore`].
//!
//! A session that closes starts a save in the background; the same player
//! may reconnect before that save lands. Without ordering, the reconnect's
//! load could read the stale record. [`Persistence`] serialises every load
//! and save for one [`AuthCode`] through a per-code async mutex, and a
//! detached save claims its slot *before* it is spawned, so any load
//! started afterwards waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use nepenthe_protocol::PlayerRecord;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::{AuthCode, PersistenceError, PlayerStore};

/// A store plus per-code sequencing.
pub struct Persistence<S> {
    store: Arc<S>,
    locks: Mutex<HashMap<AuthCode, Arc<AsyncMutex<()>>>>,
}

impl<S: PlayerStore> Persistence<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn slot(&self, code: AuthCode) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(code).or_default())
    }

    /// Drops the slot for `code` when nobody else holds or waits on it.
    fn release(&self, code: AuthCode, slot: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's copy plus ours.
        if Arc::strong_count(&slot) == 2 {
            locks.remove(&code);
        }
    }

    async fn lock(&self, code: AuthCode) -> (Arc<AsyncMutex<()>>, OwnedMutexGuard<()>) {
        let slot = self.slot(code);
        let guard = Arc::clone(&slot).lock_owned().await;
        (slot, guard)
    }

    /// Loads the record for `code`, after any earlier save for it.
    pub async fn load(&self, code: AuthCode) -> Result<Option<PlayerRecord>, PersistenceError> {
        let (slot, guard) = self.lock(code).await;
        let result = self.store.load(code).await;
        drop(guard);
        self.release(code, slot);
        result
    }

    /// Saves `record` for `code`, after any earlier load or save for it.
    pub async fn save(&self, code: AuthCode, record: &PlayerRecord) -> Result<(), PersistenceError> {
        let (slot, guard) = self.lock(code).await;
        let result = self.store.save(code, record).await;
        drop(guard);
        self.release(code, slot);
        log_save(code, &result);
        result
    }

    /// Starts a save in the background.
    ///
    /// When the code's slot is free it is claimed before this returns, so a
    /// load issued after this call observes the saved record. When it is
    /// busy the task queues behind the current holder.
    pub fn save_detached(
        self: &Arc<Self>,
        code: AuthCode,
        record: PlayerRecord,
    ) -> JoinHandle<Result<(), PersistenceError>> {
        let slot = self.slot(code);
        let claimed = Arc::clone(&slot).try_lock_owned().ok();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let guard = match claimed {
                Some(guard) => guard,
                None => Arc::clone(&slot).lock_owned().await,
            };
            let result = this.store.save(code, &record).await;
            drop(guard);
            this.release(code, slot);
            log_save(code, &result);
            result
        })
    }
}

fn log_save(code: AuthCode, result: &Result<(), PersistenceError>) {
    match result {
        Ok(()) => tracing::debug!(%code, "player record saved"),
        Err(e) => tracing::warn!(%code, error = %e, "failed to save player record"),
    }
}
