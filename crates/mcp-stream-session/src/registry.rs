//! Session registry with exclusive creation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use mcp_stream_core::SessionId;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    UnknownSession(SessionId),
}

/// A live session.
#[derive(Debug)]
pub struct Session<T> {
    /// Unique session identifier.
    pub id: SessionId,
    /// Transport serving the session.
    pub transport: Arc<T>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// Registry of live sessions.
///
/// Lookups only take the map's read lock. Creation is serialized by a
/// separate mutex that is held for the create-and-insert step and nothing
/// else, so a slow creation never delays requests for existing sessions.
pub struct SessionRegistry<T> {
    sessions: RwLock<HashMap<SessionId, Arc<Session<T>>>>,
    creation_lock: Mutex<()>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl<T> SessionRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
        }
    }

    /// Get a session by ID.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session<T>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Return the session named by `session_id`, or create one if no id is given.
    ///
    /// `create` receives the new session id and must return the transport;
    /// it runs under the creation lock and must not block. If it fails,
    /// nothing is registered. Returns the session and whether it was created.
    ///
    /// # Errors
    /// Returns `RegistryError::UnknownSession` (converted into `E`) when an
    /// explicit id is not registered, or whatever `create` returns.
    pub async fn get_or_create<F, E>(
        &self,
        session_id: Option<&str>,
        create: F,
    ) -> Result<(Arc<Session<T>>, bool), E>
    where
        F: FnOnce(&SessionId) -> Result<Arc<T>, E>,
        E: From<RegistryError>,
    {
        if let Some(id) = session_id {
            return match self.get(id).await {
                Some(session) => Ok((session, false)),
                None => Err(RegistryError::UnknownSession(id.to_string()).into()),
            };
        }

        let _guard = self.creation_lock.lock().await;
        let id = Uuid::new_v4().simple().to_string();
        let transport = create(&id)?;
        let session = Arc::new(Session {
            id: id.clone(),
            transport,
            created_at: now(),
        });
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));

        tracing::info!(session_id = %id, "Created new session");
        Ok((session, true))
    }

    /// Remove a session.
    ///
    /// Takes the creation lock so that a session whose task ends while it is
    /// still being created is removed after it was inserted, not before.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session<T>>> {
        let _guard = self.creation_lock.lock().await;
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            tracing::info!(%session_id, "Removed session");
        }
        removed
    }

    /// IDs of all live sessions.
    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Registry(#[from] RegistryError),
        #[error("create refused")]
        Refused,
    }

    fn transport(id: &SessionId) -> Result<Arc<String>, TestError> {
        Ok(Arc::new(format!("transport-{id}")))
    }

    #[tokio::test]
    async fn test_create_then_lookup() {
        let registry = SessionRegistry::new();

        let (created, is_new) = registry.get_or_create(None, transport).await.unwrap();
        assert!(is_new);
        assert_eq!(created.id.len(), 32);
        assert_eq!(*created.transport, format!("transport-{}", created.id));

        let (found, is_new) = registry
            .get_or_create(Some(&created.id), transport)
            .await
            .unwrap();
        assert!(!is_new);
        assert!(Arc::ptr_eq(&created, &found));
    }

    #[tokio::test]
    async fn test_unknown_id_is_rejected_without_creating() {
        let registry: SessionRegistry<String> = SessionRegistry::new();
        let called = AtomicBool::new(false);

        let result = registry
            .get_or_create(Some("not-a-session"), |id| {
                called.store(true, Ordering::SeqCst);
                transport(id)
            })
            .await;

        assert!(matches!(
            result,
            Err(TestError::Registry(RegistryError::UnknownSession(ref id))) if id == "not-a-session"
        ));
        assert!(!called.load(Ordering::SeqCst));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing() {
        let registry: SessionRegistry<String> = SessionRegistry::new();

        let result = registry.get_or_create(None, |_| Err(TestError::Refused)).await;
        assert!(matches!(result, Err(TestError::Refused)));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_distinct_sessions() {
        let registry = Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (session, created) = registry.get_or_create(None, transport).await.unwrap();
                    assert!(created);
                    session.id.clone()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(registry.len().await, 64);
    }

    #[tokio::test]
    async fn test_lock_released_while_caller_handles_request() {
        let registry = Arc::new(SessionRegistry::new());
        let (first, _) = registry.get_or_create(None, transport).await.unwrap();

        // The first caller is still "handling" its request while holding the session.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            let _session = first;
            let _ = release_rx.await;
        });

        let second = tokio::time::timeout(
            Duration::from_secs(1),
            registry.get_or_create(None, transport),
        )
        .await;
        assert!(second.is_ok());

        let _ = release_tx.send(());
        holder.await.unwrap();
    }

    #[test]
    fn test_now_is_epoch_seconds() {
        let secs = now();
        // After 2020-09-13 and not in milliseconds.
        assert!(secs > 1_600_000_000);
        assert!(secs < 100_000_000_000);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = SessionRegistry::new();
        let (session, _) = registry.get_or_create(None, transport).await.unwrap();

        assert!(registry.remove(&session.id).await.is_some());
        assert!(registry.get(&session.id).await.is_none());
        assert!(registry.remove(&session.id).await.is_none());
        assert!(registry.ids().await.is_empty());
    }
}
