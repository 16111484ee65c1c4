//! The tab resolver the binary wires into the session controller.
//!
//! This driver's `attach` synthesizes a target id from the tab handle
//! rather than discovering targets via `Target.getTargets`, so there is
//! exactly one tab this process ever drives. Resolution is correspondingly
//! trivial: always the same handle, created lazily on first use.

use std::time::Duration;

use async_trait::async_trait;

use core_types::{AgentError, TabHandle};
use session_controller::TabResolver;

const DEFAULT_TAB: TabHandle = TabHandle(1);

#[derive(Default)]
pub struct SingleTabResolver;

#[async_trait]
impl TabResolver for SingleTabResolver {
    async fn resolve(&self, requested: Option<TabHandle>) -> Result<Option<TabHandle>, AgentError> {
        Ok(Some(requested.unwrap_or(DEFAULT_TAB)))
    }

    async fn create_tab(&self, _deadline: Duration) -> Result<TabHandle, AgentError> {
        Ok(DEFAULT_TAB)
    }
}
