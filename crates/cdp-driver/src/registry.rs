//! Tracks which tab owns the process's one CDP attachment.
//!
//! Enforces a single-attachment invariant: at most one CDP attachment per
//! tab, and in this driver's design, at most one attachment in the whole
//! process (a single debugger session targets a single tab at a time).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use core_types::TabHandle;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentContext {
    pub target_id: Option<String>,
    pub cdp_session: Option<String>,
    pub recent_url: Option<String>,
    pub recent_title: Option<String>,
}

/// Concurrent registry of attachment bookkeeping, keyed by tab handle.
#[derive(Default)]
pub struct Registry {
    attachments: DashMap<TabHandle, AttachmentContext>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            attachments: DashMap::new(),
        }
    }

    /// Returns true if a *different* tab already holds an attachment.
    pub fn has_conflicting_attachment(&self, tab: TabHandle) -> bool {
        self.attachments.iter().any(|entry| *entry.key() != tab)
    }

    pub fn is_attached(&self, tab: TabHandle) -> bool {
        self.attachments.contains_key(&tab)
    }

    pub fn insert(&self, tab: TabHandle, target_id: Option<String>, cdp_session: Option<String>) {
        self.attachments.insert(
            tab,
            AttachmentContext {
                target_id,
                cdp_session,
                recent_url: None,
                recent_title: None,
            },
        );
    }

    pub fn remove(&self, tab: TabHandle) {
        self.attachments.remove(&tab);
    }

    pub fn set_recent_state(&self, tab: TabHandle, url: Option<String>, title: Option<String>) {
        if let Some(mut entry) = self.attachments.get_mut(&tab) {
            if url.is_some() {
                entry.recent_url = url;
            }
            if title.is_some() {
                entry.recent_title = title;
            }
        }
    }

    pub fn get(&self, tab: TabHandle) -> Option<AttachmentContext> {
        self.attachments.get(&tab).map(|entry| entry.value().clone())
    }

    pub fn cdp_session(&self, tab: TabHandle) -> Option<String> {
        self.attachments
            .get(&tab)
            .and_then(|entry| entry.cdp_session.clone())
    }

    /// Reverse lookup used when a host-initiated detach event names a CDP
    /// session id rather than a tab: the only way to know which attachment
    /// just vanished.
    pub fn tab_for_session(&self, session_id: &str) -> Option<TabHandle> {
        self.attachments
            .iter()
            .find(|entry| entry.cdp_session.as_deref() == Some(session_id))
            .map(|entry| *entry.key())
    }

    pub fn attached_tabs(&self) -> Vec<TabHandle> {
        self.attachments.iter().map(|entry| *entry.key()).collect()
    }

    pub fn clear(&self) {
        self.attachments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attachment_invariant() {
        let registry = Registry::new();
        let tab_a = TabHandle(1);
        let tab_b = TabHandle(2);

        registry.insert(tab_a, Some("target-a".into()), Some("session-a".into()));
        assert!(registry.is_attached(tab_a));
        assert!(registry.has_conflicting_attachment(tab_b));
        assert!(!registry.has_conflicting_attachment(tab_a));

        registry.remove(tab_a);
        assert!(!registry.is_attached(tab_a));
        assert!(!registry.has_conflicting_attachment(tab_b));
    }

    #[test]
    fn tab_for_session_finds_the_owning_tab() {
        let registry = Registry::new();
        registry.insert(TabHandle(1), Some("target-a".into()), Some("session-a".into()));
        registry.insert(TabHandle(2), Some("target-b".into()), Some("session-b".into()));

        assert_eq!(registry.tab_for_session("session-b"), Some(TabHandle(2)));
        assert_eq!(registry.tab_for_session("session-unknown"), None);

        registry.remove(TabHandle(2));
        assert_eq!(registry.tab_for_session("session-b"), None);
    }

    #[test]
    fn double_insert_is_idempotent_for_same_tab() {
        let registry = Registry::new();
        let tab = TabHandle(7);
        registry.insert(tab, Some("t1".into()), Some("s1".into()));
        registry.insert(tab, Some("t1".into()), Some("s2".into()));
        assert_eq!(registry.attached_tabs().len(), 1);
        assert_eq!(registry.cdp_session(tab), Some("s2".into()));
    }
}
