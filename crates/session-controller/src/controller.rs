//! The session state machine: IDLE -> CLEANING -> ATTACHING -> RUNNING ->
//! CLEANING -> IDLE, serialized by a single cleanup mutex so that "another
//! debugger already attached" never happens from within this process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use cdp_driver::CdpDriver;
use core_types::{AgentError, PersistentSessionRecord, SessionId, TabHandle};

use crate::store::PersistentStore;

const CLEANUP_SETTLE_DELAY: Duration = Duration::from_millis(500);
const EXIT_CLEANING_DELAY: Duration = Duration::from_millis(300);
const NEW_TAB_LOAD_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Cleaning,
    Attaching,
    Running,
}

/// Resolves or creates the tab a session should run against. The
/// controller cannot itself judge whether a tab URL is privileged or which
/// tab is "current" — that is host policy, supplied here as a trait object
/// so the same controller works across embeddings.
#[async_trait::async_trait]
pub trait TabResolver: Send + Sync {
    /// Returns `Some(tab)` if the requested tab (or the host's current
    /// tab, if none was requested) is suitable to run a session against.
    async fn resolve(&self, requested: Option<TabHandle>) -> Result<Option<TabHandle>, AgentError>;

    /// Creates a fresh tab navigated to a safe default and waits for its
    /// `complete` ready state, up to the caller's deadline.
    async fn create_tab(&self, deadline: Duration) -> Result<TabHandle, AgentError>;
}

pub struct SessionController<D: CdpDriver> {
    driver: Arc<D>,
    store: Arc<dyn PersistentStore>,
    resolver: Arc<dyn TabResolver>,
    cleanup_mutex: Mutex<()>,
    state: Mutex<SessionState>,
    current_session: Mutex<Option<SessionId>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl<D: CdpDriver> SessionController<D> {
    pub fn new(
        driver: Arc<D>,
        store: Arc<dyn PersistentStore>,
        resolver: Arc<dyn TabResolver>,
    ) -> Self {
        Self {
            driver,
            store,
            resolver,
            cleanup_mutex: Mutex::new(()),
            state: Mutex::new(SessionState::Idle),
            current_session: Mutex::new(None),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn current_session(&self) -> Option<SessionId> {
        self.current_session.lock().await.clone()
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    /// Reads the persistent record on start-up; any `isActive=true` or
    /// non-null `activeTabId` means a previous incarnation may still hold
    /// a live attachment, so the first session always goes through
    /// CLEANING before ATTACHING.
    pub async fn reconcile_on_startup(&self) -> Result<(), AgentError> {
        let record = self.store.load().await?;
        if record.is_active || record.active_tab.is_some() {
            info!(target: "session-controller", ?record.active_tab, "stale attachment possible; cleaning before first session");
            self.clean(record.active_tab).await?;
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    pub async fn start(
        &self,
        session_id: SessionId,
        requested_tab: Option<TabHandle>,
    ) -> Result<TabHandle, AgentError> {
        self.stopped.store(false, std::sync::atomic::Ordering::SeqCst);
        self.set_state(SessionState::Cleaning).await;

        let previous = self.store.load().await?;
        self.clean(previous.active_tab).await?;

        self.set_state(SessionState::Attaching).await;
        let tab = match self.attach(requested_tab).await {
            Ok(tab) => tab,
            Err(err) => {
                self.set_state(SessionState::Idle).await;
                return Err(err);
            }
        };

        let mut record = PersistentSessionRecord {
            active_tab: Some(tab),
            session_id: Some(session_id.clone()),
            is_active: true,
            last_update: None,
        };
        record.touch();
        self.store.save(&record).await?;

        *self.current_session.lock().await = Some(session_id);
        self.set_state(SessionState::Running).await;
        Ok(tab)
    }

    /// External stop: mark stopped, detach, and run exit-CLEANING. The
    /// persistent record's `activeTabId` is retained so the next
    /// incarnation can still find and tear it down.
    #[instrument(level = "info", skip(self))]
    pub async fn stop(&self) -> Result<(), AgentError> {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);

        let tab = self.current_session_tab().await;
        if let Some(tab) = tab {
            let _ = self.driver.detach(tab).await;
        }

        let mut record = self.store.load().await.unwrap_or_default();
        record.is_active = false;
        record.touch();
        self.store.save(&record).await?;

        *self.current_session.lock().await = None;
        tokio::time::sleep(EXIT_CLEANING_DELAY).await;
        self.set_state(SessionState::Idle).await;
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Reacts to a host-initiated detach surfaced via the routing fabric:
    /// the browser tore the attachment down on its own, so there is no
    /// cleanup call to issue, only the session bookkeeping an explicit
    /// `stop` would otherwise perform.
    #[instrument(level = "info", skip(self))]
    pub async fn handle_external_detach(&self, tab: TabHandle) -> Result<(), AgentError> {
        if self.current_session_tab().await != Some(tab) {
            return Ok(());
        }
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);

        let mut record = self.store.load().await.unwrap_or_default();
        record.is_active = false;
        record.touch();
        self.store.save(&record).await?;

        *self.current_session.lock().await = None;
        self.set_state(SessionState::Idle).await;
        warn!(target: "session-controller", tab = tab.0, "external detach observed; session stopped without cleanup calls");
        Ok(())
    }

    async fn current_session_tab(&self) -> Option<TabHandle> {
        self.store.load().await.ok().and_then(|r| r.active_tab)
    }

    async fn set_state(&self, new_state: SessionState) {
        *self.state.lock().await = new_state;
    }

    /// Tears down any previous attachment on the target tab and on the
    /// tab recorded in persistent storage, serialized by the cleanup
    /// mutex so concurrent start/stop calls never race each other.
    async fn clean(&self, stale_tab: Option<TabHandle>) -> Result<(), AgentError> {
        let _guard = self.cleanup_mutex.lock().await;

        if let Some(tab) = stale_tab {
            if let Err(err) = self.driver.detach(tab).await {
                warn!(target: "session-controller", ?err, tab = tab.0, "detach during cleanup failed; continuing");
            }
        }

        tokio::time::sleep(CLEANUP_SETTLE_DELAY).await;
        Ok(())
    }

    async fn attach(&self, requested_tab: Option<TabHandle>) -> Result<TabHandle, AgentError> {
        let tab = match self.resolver.resolve(requested_tab).await? {
            Some(tab) => tab,
            None => self.resolver.create_tab(NEW_TAB_LOAD_DEADLINE).await?,
        };

        self.driver.attach(tab).await?;
        Ok(tab)
    }
}
