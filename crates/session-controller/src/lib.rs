//! Owns the per-tab session lifecycle: the single-attachment invariant,
//! and durable transitions so a restarted host can detect and clean up a
//! stale attachment left by a previous incarnation.

pub mod controller;
pub mod store;

pub use controller::{SessionController, SessionState, TabResolver};
pub use store::{FileStore, MemoryStore, PersistentStore};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdp_driver::{CdpDriver, ChromiumDriver, NoopTransport};
    use core_types::{AgentError, SessionId, TabHandle};
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedResolver {
        tab: TabHandle,
    }

    #[async_trait]
    impl TabResolver for FixedResolver {
        async fn resolve(&self, requested: Option<TabHandle>) -> Result<Option<TabHandle>, AgentError> {
            Ok(Some(requested.unwrap_or(self.tab)))
        }

        async fn create_tab(&self, _deadline: Duration) -> Result<TabHandle, AgentError> {
            Ok(self.tab)
        }
    }

    fn test_controller() -> SessionController<ChromiumDriver<NoopTransport>> {
        let driver = Arc::new(ChromiumDriver::new(
            NoopTransport::default(),
            cdp_driver::CdpConfig::default(),
            routing_fabric::Router::new(),
        ));
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::default());
        let resolver: Arc<dyn TabResolver> = Arc::new(FixedResolver { tab: TabHandle(1) });
        SessionController::new(driver, store, resolver)
    }

    #[tokio::test]
    async fn stop_retains_active_tab_for_next_incarnation() {
        let controller = test_controller();
        let tab = controller
            .start(SessionId::new(), None)
            .await
            .expect("first session attaches");
        assert_eq!(controller.state().await, SessionState::Running);

        controller.stop().await.expect("stop clears isActive");
        assert_eq!(controller.state().await, SessionState::Idle);

        let record = controller.store().load().await.unwrap();
        assert!(!record.is_active, "isActive must be cleared on stop");
        assert_eq!(
            record.active_tab,
            Some(tab),
            "activeTabId must survive stop so the next session can clean it up"
        );
    }

    #[tokio::test]
    async fn back_to_back_sessions_reuse_the_cleanup_path() {
        let controller = test_controller();

        let first = controller.start(SessionId::new(), None).await.unwrap();
        controller.stop().await.unwrap();

        let second = controller.start(SessionId::new(), None).await.unwrap();
        assert_eq!(first, second, "fixed resolver always returns the same tab");
        assert_eq!(controller.state().await, SessionState::Running);
    }

    #[tokio::test]
    async fn startup_reconciliation_cleans_a_stale_record() {
        let controller = test_controller();
        let mut stale = core_types::PersistentSessionRecord {
            active_tab: Some(TabHandle(1)),
            session_id: Some(SessionId::new()),
            is_active: true,
            last_update: None,
        };
        stale.touch();
        controller.store().save(&stale).await.unwrap();

        controller.reconcile_on_startup().await.unwrap();
        assert_eq!(controller.state().await, SessionState::Idle);
    }
}
