//! Process-scoped server context.
//!
//! Owns the session registry, the task supervisor and the shared event store,
//! and wires a new transport to the protocol engine whenever a session is
//! created.

use std::{sync::Arc, time::Duration};

use mcp_stream_core::{
    DEFAULT_MAX_EVENTS_PER_STREAM, EventStore, InMemoryEventStore, ProtocolEngine, SessionId,
};
use mcp_stream_session::{
    DEFAULT_SHUTDOWN_TIMEOUT, Session, SessionRegistry, SupervisorError, TaskSupervisor,
};
use tracing::Instrument;

use crate::{
    error::RouterError,
    streamable_http::{StreamableHttpTransport, TransportConfig},
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// Per-stream event retention; only used when resumability is enabled.
    pub max_events_per_stream: usize,
    /// Record outbound messages so clients can resume with `last-event-id`.
    pub enable_resumability: bool,
    /// How long shutdown waits for session tasks.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
            enable_resumability: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Everything the request router needs, created once per process.
pub struct ServerContext {
    registry: Arc<SessionRegistry<StreamableHttpTransport>>,
    supervisor: TaskSupervisor,
    event_store: Option<Arc<dyn EventStore>>,
    engine: Arc<dyn ProtocolEngine>,
    config: ServerConfig,
}

impl ServerContext {
    /// Create a context backed by an in-memory event store (when
    /// resumability is enabled).
    #[must_use]
    pub fn new(engine: Arc<dyn ProtocolEngine>, config: ServerConfig) -> Self {
        let event_store = config.enable_resumability.then(|| {
            Arc::new(InMemoryEventStore::with_max_events_per_stream(
                config.max_events_per_stream,
            )) as Arc<dyn EventStore>
        });
        Self::with_event_store(engine, config, event_store)
    }

    /// Create a context with a caller-supplied event store.
    #[must_use]
    pub fn with_event_store(
        engine: Arc<dyn ProtocolEngine>,
        config: ServerConfig,
        event_store: Option<Arc<dyn EventStore>>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            supervisor: TaskSupervisor::new(),
            event_store,
            engine,
            config,
        }
    }

    /// Start the task supervisor. Sessions cannot be created before this.
    ///
    /// # Errors
    /// Returns error if already started or shut down.
    pub fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start()
    }

    /// Terminate every session and stop the supervisor.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids().await;
        tracing::info!(sessions = ids.len(), "Shutting down server context");
        self.supervisor.shutdown(self.config.shutdown_timeout).await;

        // Tasks that missed the deadline still must not serve requests.
        for id in ids {
            if let Some(session) = self.registry.remove(&id).await {
                session.transport.close().await;
            }
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry<StreamableHttpTransport> {
        &self.registry
    }

    #[must_use]
    pub const fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    #[must_use]
    pub fn event_store(&self) -> Option<&Arc<dyn EventStore>> {
        self.event_store.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Look up the session named by `session_id`, or create one if none is given.
    ///
    /// # Errors
    /// Returns `UnknownSession` for an unregistered id, or `Supervisor` when
    /// the session task cannot be started.
    pub async fn get_or_create_session(
        &self,
        session_id: Option<&str>,
    ) -> Result<(Arc<Session<StreamableHttpTransport>>, bool), RouterError> {
        self.registry
            .get_or_create(session_id, |id| self.create_session(id))
            .await
    }

    fn create_session(&self, session_id: &SessionId) -> Result<Arc<StreamableHttpTransport>, RouterError> {
        let transport = Arc::new(StreamableHttpTransport::new(
            session_id.clone(),
            self.config.transport.clone(),
            self.event_store.clone(),
        ));
        let (streams, outbound) = transport.connect()?;

        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        let task_transport = Arc::clone(&transport);
        let span = tracing::info_span!("session", session_id = %session_id);

        self.supervisor.spawn(session_id, move |shutdown| {
            async move {
                tokio::select! {
                    (result, ()) = async { tokio::join!(engine.run(streams), outbound.run()) } => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "Protocol engine stopped with error");
                        }
                    }
                    () = task_transport.wait_closed() => {}
                    () = shutdown.cancelled() => {
                        tracing::debug!("Session cancelled by shutdown");
                    }
                }

                task_transport.close().await;
                registry.remove(task_transport.session_id()).await;
            }
            .instrument(span)
        })?;

        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mcp_stream_core::{EngineError, SessionStreams};
    use tokio_test::assert_ok;

    use super::*;

    struct IdleEngine;

    #[async_trait]
    impl ProtocolEngine for IdleEngine {
        async fn run(&self, mut streams: SessionStreams) -> Result<(), EngineError> {
            while streams.inbound.recv().await.is_some() {}
            Ok(())
        }
    }

    fn context() -> ServerContext {
        ServerContext::new(Arc::new(IdleEngine), ServerConfig::default())
    }

    #[tokio::test]
    async fn test_create_requires_started_supervisor() {
        let ctx = context();
        let result = ctx.get_or_create_session(None).await;
        assert!(matches!(
            result,
            Err(RouterError::Supervisor(SupervisorError::NotRunning))
        ));
        assert!(ctx.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_closed_session_leaves_registry() {
        let ctx = context();
        assert_ok!(ctx.start());

        let (session, created) = ctx.get_or_create_session(None).await.unwrap();
        assert!(created);
        assert_eq!(ctx.supervisor().active_tasks(), 1);

        session.transport.close().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while ctx.registry().get(&session.id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_sessions() {
        let ctx = context();
        assert_ok!(ctx.start());
        let (a, _) = ctx.get_or_create_session(None).await.unwrap();
        let (b, _) = ctx.get_or_create_session(None).await.unwrap();

        ctx.shutdown().await;

        assert!(a.transport.is_closed());
        assert!(b.transport.is_closed());
        assert!(ctx.registry().is_empty().await);
        assert_eq!(ctx.supervisor().active_tasks(), 0);
    }

    #[test]
    fn test_resumability_toggle() {
        let config = ServerConfig {
            enable_resumability: false,
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(Arc::new(IdleEngine), config);
        assert!(ctx.event_store().is_none());
        assert!(context().event_store().is_some());
    }
}
