//! An in-memory `CdpDriver` double with no real browser underneath it, for
//! exercising the session controller and agent loop without Chrome.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use core_types::{AgentError, AgentErrorKind, ClickMethod, InteractiveElement, TabHandle};

use crate::driver::{CdpDriver, ClickOutcome, PageState};
use crate::registry::Registry;

#[derive(Clone, Debug)]
pub struct StubPage {
    pub url: String,
    pub title: String,
    pub elements: Vec<InteractiveElement>,
}

impl Default for StubPage {
    fn default() -> Self {
        Self {
            url: "about:blank".into(),
            title: String::new(),
            elements: Vec::new(),
        }
    }
}

/// Scripted, deterministic driver. Every call to `click_element` advances
/// to the next queued page in `navigations_on_click`, if any, so tests can
/// assert on the navigated/no-navigation branches precisely.
pub struct StubDriver {
    registry: Registry,
    page: Mutex<StubPage>,
    navigations_on_click: Mutex<std::collections::VecDeque<Option<StubPage>>>,
}

impl StubDriver {
    pub fn new(initial: StubPage) -> Self {
        Self {
            registry: Registry::new(),
            page: Mutex::new(initial),
            navigations_on_click: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queues what the page should look like after the Nth future click;
    /// `None` means the click lands but nothing navigates.
    pub fn queue_click_result(&self, next: Option<StubPage>) {
        self.navigations_on_click.lock().unwrap().push_back(next);
    }

    pub fn current_url(&self) -> String {
        self.page.lock().unwrap().url.clone()
    }
}

#[async_trait]
impl CdpDriver for StubDriver {
    async fn attach(&self, tab: TabHandle) -> Result<(), AgentError> {
        if self.registry.has_conflicting_attachment(tab) {
            return Err(AgentError::new(AgentErrorKind::AttachmentConflict)
                .with_hint("stub driver already attached elsewhere"));
        }
        self.registry.insert(tab, None, None);
        Ok(())
    }

    async fn detach(&self, tab: TabHandle) -> Result<(), AgentError> {
        self.registry.remove(tab);
        Ok(())
    }

    async fn navigate(&self, _tab: TabHandle, url: &str) -> Result<(), AgentError> {
        let mut page = self.page.lock().unwrap();
        page.url = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, _tab: TabHandle, _expression: &str) -> Result<Value, AgentError> {
        Ok(Value::Null)
    }

    async fn click_at(&self, _tab: TabHandle, _x: f64, _y: f64) -> Result<(), AgentError> {
        Ok(())
    }

    async fn click_element(
        &self,
        _tab: TabHandle,
        _selector: &str,
        _method: ClickMethod,
    ) -> Result<ClickOutcome, AgentError> {
        let next = self.navigations_on_click.lock().unwrap().pop_front();
        let navigated = match next {
            Some(Some(new_page)) => {
                *self.page.lock().unwrap() = new_page;
                true
            }
            Some(None) => false,
            None => false,
        };
        Ok(ClickOutcome { method_used: ClickMethod::Auto, navigated })
    }

    async fn submit_via_enter(&self, _tab: TabHandle, _selector: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn type_text(&self, _tab: TabHandle, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn type_in_element(
        &self,
        _tab: TabHandle,
        _selector: &str,
        _text: &str,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn scroll(&self, _tab: TabHandle, _dy: f64) -> Result<(), AgentError> {
        Ok(())
    }

    async fn capture_screenshot(&self, _tab: TabHandle) -> Result<String, AgentError> {
        Ok(String::new())
    }

    async fn get_page_state(&self, _tab: TabHandle) -> Result<PageState, AgentError> {
        let page = self.page.lock().unwrap();
        Ok(PageState {
            url: page.url.clone(),
            title: page.title.clone(),
            ready_state: "complete".into(),
        })
    }

    async fn get_clickable_elements(
        &self,
        _tab: TabHandle,
    ) -> Result<Vec<InteractiveElement>, AgentError> {
        Ok(self.page.lock().unwrap().elements.clone())
    }
}
