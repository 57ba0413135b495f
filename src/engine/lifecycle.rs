use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::engine::{
    bus::EventBus,
    error::EngineError,
    events::OutputEvent,
    metrics::EngineMetrics,
    sandbox::{SandboxBackend, SandboxHandle},
    session::SessionId,
};

/// Live sandboxes keyed by session. The only state shared between sessions;
/// used to find a sandbox for kill and cleanup.
#[derive(Clone)]
pub struct SandboxRegistry {
    sandboxes: Arc<DashMap<SessionId, Arc<SandboxHandle>>>,
    backend: Arc<dyn SandboxBackend>,
    metrics: Arc<EngineMetrics>,
}

impl SandboxRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            sandboxes: Arc::new(DashMap::new()),
            backend,
            metrics,
        }
    }

    pub fn register(&self, sandbox: Arc<SandboxHandle>) -> Result<(), EngineError> {
        let session_id = sandbox.session_id().clone();
        match self.sandboxes.entry(session_id) {
            Entry::Occupied(entry) => Err(EngineError::Internal(format!(
                "session {} already owns a sandbox",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(sandbox);
                self.metrics.sandbox_acquired();
                Ok(())
            }
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SandboxHandle>> {
        self.sandboxes.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sandboxes.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.sandboxes.len()
    }

    /// Force-stops the session's sandbox without removing it.
    pub async fn kill(&self, session_id: &SessionId) -> bool {
        let Some(sandbox) = self.get(session_id) else {
            return false;
        };
        if let Err(err) = self.backend.kill(&sandbox).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to kill sandbox");
        }
        true
    }

    /// Stops and removes the session's sandbox. Whoever gets here first does
    /// the work and gets `true`; every later or concurrent call is a no-op.
    pub async fn cleanup(&self, session_id: &SessionId) -> bool {
        let Some((_, sandbox)) = self.sandboxes.remove(session_id) else {
            return false;
        };
        if !sandbox.begin_teardown() {
            return false;
        }
        self.metrics.sandbox_released();

        if let Err(err) = self.backend.kill(&sandbox).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to stop sandbox during cleanup");
        }
        match self.backend.remove(&sandbox).await {
            Ok(()) => tracing::info!(
                session_id = %session_id,
                sandbox = sandbox.name(),
                backend = self.backend.name(),
                "sandbox cleaned up"
            ),
            Err(err) => tracing::warn!(
                session_id = %session_id,
                sandbox = sandbox.name(),
                error = %err,
                "sandbox cleanup failed"
            ),
        }
        true
    }

    /// Cleans up every sandbox still registered. Returns how many there were.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sandboxes.iter().map(|entry| entry.key().clone()).collect();
        let mut cleaned = 0;
        for id in ids {
            if self.cleanup(&id).await {
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Cleanup and a terminal event that still happen if the owning task is
    /// aborted or panics before finishing the session.
    pub fn guard(&self, session_id: SessionId, bus: EventBus) -> CleanupGuard {
        CleanupGuard {
            registry: self.clone(),
            bus,
            session_id,
        }
    }
}

pub struct CleanupGuard {
    registry: SandboxRegistry,
    bus: EventBus,
    session_id: SessionId,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let has_sandbox = self.registry.contains(&self.session_id);
        if !has_sandbox && !self.bus.is_open(&self.session_id) {
            return;
        }
        tracing::warn!(session_id = %self.session_id, "session ended abnormally; cleaning up");
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let session_id = self.session_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.cleanup(&session_id).await;
                    registry.abandon(&bus, &session_id);
                });
            }
            Err(_) => {
                if has_sandbox {
                    tracing::error!(session_id = %session_id, "no runtime left to clean up sandbox");
                }
                registry.abandon(&bus, &session_id);
            }
        }
    }
}

impl SandboxRegistry {
    /// Ends a session nobody is driving anymore with a generic error.
    fn abandon(&self, bus: &EventBus, session_id: &SessionId) {
        let message = EngineError::Internal(String::new()).public_message();
        if bus.publish(session_id, OutputEvent::error(session_id.as_str(), message)) {
            self.metrics.session_failed();
        }
    }
}
