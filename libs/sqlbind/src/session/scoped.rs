//! Registry of sessions keyed by a scope function.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::RoutingSession;
use crate::Result;
use crate::config::SessionOptions;
use crate::engine::Engine;

/// Returns the identity of the current unit of work.
pub type ScopeFn = Arc<dyn Fn() -> String + Send + Sync>;

static NEXT_THREAD_SCOPE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SCOPE: u64 = NEXT_THREAD_SCOPE.fetch_add(1, Ordering::Relaxed);
}

/// Default scope: the current thread.
#[must_use]
pub fn thread_scope() -> String {
    THREAD_SCOPE.with(|id| format!("thread-{id}"))
}

/// One [`RoutingSession`] per scope.
#[derive(Clone)]
pub struct ScopedSession {
    engines: Arc<BTreeMap<String, Arc<Engine>>>,
    options: SessionOptions,
    scope: ScopeFn,
    sessions: Arc<DashMap<String, Arc<RoutingSession>>>,
}

impl fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSession")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl ScopedSession {
    /// # Errors
    /// Returns `DbError::Configuration` for invalid session options.
    pub fn new(
        engines: Arc<BTreeMap<String, Arc<Engine>>>,
        options: SessionOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            engines,
            options,
            scope: Arc::new(thread_scope),
            sessions: Arc::new(DashMap::new()),
        })
    }

    /// Replace the scope function (e.g. a task id under async execution).
    #[must_use]
    pub fn with_scope(mut self, scope: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.scope = Arc::new(scope);
        self
    }

    #[must_use]
    pub fn scope_id(&self) -> String {
        (self.scope)()
    }

    /// Session of the current scope, created on first use.
    #[must_use]
    pub fn current(&self) -> Arc<RoutingSession> {
        let id = self.scope_id();
        Arc::clone(
            self.sessions
                .entry(id)
                .or_insert_with(|| {
                    Arc::new(RoutingSession::with_options(
                        Arc::clone(&self.engines),
                        self.options.clone(),
                    ))
                })
                .value(),
        )
    }

    /// Whether the current scope already has a session.
    #[must_use]
    pub fn has_current(&self) -> bool {
        self.sessions.contains_key(&self.scope_id())
    }

    /// Close and forget the current scope's session.
    ///
    /// # Errors
    /// Returns the error of rolling back the session's open transactions.
    pub async fn remove(&self) -> Result<()> {
        let removed = self.sessions.remove(&self.scope_id());
        if let Some((_, session)) = removed {
            session.close().await?;
        }
        Ok(())
    }

    /// Number of live scoped sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
