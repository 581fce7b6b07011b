use std::collections::HashMap;
use std::sync::Arc;

use fitledger_core::{
    validate_user_id, EconomyConfig, EconomyError, RewardCatalog, SessionStore, UserSession,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ServiceError;

pub const DEFAULT_MAX_CACHED_SESSIONS: usize = 10_000;

/// Per-user slot; `None` until the session has been loaded from the store.
type SessionSlot = Arc<Mutex<Option<UserSession>>>;

/// Live user sessions, loaded lazily from the store.
///
/// Each user has its own lock, held across load and mutate-and-persist, so
/// requests for one user are serialized while different users proceed in
/// parallel. The map lock is never held across store IO.
///
/// Cached sessions always equal their persisted state, so any slot nobody is
/// using can be dropped once the cache reaches `max_cached`.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    catalog: Arc<RewardCatalog>,
    config: Arc<EconomyConfig>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    max_cached: usize,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        catalog: Arc<RewardCatalog>,
        config: Arc<EconomyConfig>,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            sessions: Mutex::new(HashMap::new()),
            max_cached: DEFAULT_MAX_CACHED_SESSIONS,
        }
    }

    pub fn with_max_cached_sessions(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached.max(1);
        self
    }

    pub fn store_label(&self) -> &'static str {
        self.store.label()
    }

    pub fn catalog(&self) -> &Arc<RewardCatalog> {
        &self.catalog
    }

    pub async fn cached_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn load(&self, user_id: &str) -> Result<UserSession, ServiceError> {
        let session = match self.store.load(user_id).await? {
            Some(snapshot) => {
                UserSession::restore(snapshot, self.catalog.clone(), self.config.clone())?
            }
            None => {
                debug!(user_id, "Starting new user session");
                UserSession::new(user_id, self.catalog.clone(), self.config.clone())?
            }
        };
        Ok(session)
    }

    async fn ensure_loaded<'a>(
        &self,
        user_id: &str,
        slot: &'a mut Option<UserSession>,
    ) -> Result<&'a mut UserSession, ServiceError> {
        let session = match slot.take() {
            Some(session) => session,
            None => self.load(user_id).await?,
        };
        Ok(slot.insert(session))
    }

    async fn cached_slot(&self, user_id: &str) -> Option<SessionSlot> {
        self.sessions.lock().await.get(user_id).cloned()
    }

    async fn slot(&self, user_id: &str) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get(user_id) {
            return slot.clone();
        }

        if sessions.len() >= self.max_cached {
            let before = sessions.len();
            sessions.retain(|_, slot| Arc::strong_count(slot) > 1);
            debug!(
                evicted = before - sessions.len(),
                cached = sessions.len(),
                "Evicted idle sessions"
            );
        }

        let slot: SessionSlot = Arc::new(Mutex::new(None));
        sessions.insert(user_id.to_string(), slot.clone());
        slot
    }

    /// Read a user's session. Users not in the cache are loaded for this call
    /// only and are not retained.
    pub async fn read<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&UserSession) -> T,
    ) -> Result<T, ServiceError> {
        validate_user_id(user_id)?;

        match self.cached_slot(user_id).await {
            Some(slot) => {
                let mut guard = slot.lock().await;
                let session = self.ensure_loaded(user_id, &mut guard).await?;
                Ok(f(session))
            }
            None => {
                let session = self.load(user_id).await?;
                Ok(f(&session))
            }
        }
    }

    /// Apply `f` to a working copy, persist it, then publish it.
    ///
    /// If `f` fails or the store rejects the snapshot, the live session is
    /// left exactly as it was before the call.
    pub async fn mutate<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserSession) -> Result<T, EconomyError>,
    ) -> Result<T, ServiceError> {
        validate_user_id(user_id)?;

        let slot = self.slot(user_id).await;
        let mut guard = slot.lock().await;
        let current = self.ensure_loaded(user_id, &mut guard).await?;

        let mut working = current.clone();
        let value = f(&mut working)?;

        if let Err(err) = self.store.save(&working.snapshot()).await {
            warn!(
                user_id,
                backend = self.store.label(),
                error = %err,
                "Session save failed; discarding in-memory changes"
            );
            return Err(err.into());
        }

        *current = working;
        Ok(value)
    }
}
